//! Server-sent event streams for live job progress

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, Sse},
};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::routes::acting_user;
use crate::services::notifications::PushEvent;
use crate::state::AppState;

fn to_sse(event: PushEvent) -> std::result::Result<Event, Infallible> {
    let mut sse = Event::default().event(event.event).data(event.data.to_string());
    if let Some(id) = event.id {
        sse = sse.id(id);
    }
    if let Some(retry) = event.retry {
        sse = sse.retry(Duration::from_millis(retry));
    }
    Ok(sse)
}

/// GET /api/v1/notifications/stream
///
/// Opens a notification channel for the acting user. The channel closes
/// when the client disconnects.
pub async fn notification_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let user_id = acting_user(&headers)?;
    let channel = state.hub.register(&user_id);
    info!(user_id = %user_id, channel_id = %channel.id(), "Notification stream opened");
    Ok(Sse::new(channel.into_stream().map(to_sse)))
}

/// GET /api/v1/jobs/:id/events
///
/// Streams one job's push events, starting with a snapshot of its current
/// state. A job already in a terminal state yields only the snapshot.
pub async fn job_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let user_id = acting_user(&headers)?;
    // Subscribe before reading the snapshot so no update falls in between
    let updates: BoxStream<'static, PushEvent> = state.events.watch(id).boxed();

    let job = state.queue.get(id).await?;
    if job
        .payload
        .get("user_id")
        .and_then(|v| v.as_str())
        .is_some_and(|owner| owner != user_id)
    {
        return Err(AppError::NotFound(format!("Job not found: {}", id)));
    }

    let snapshot = PushEvent::new(
        "snapshot",
        json!({
            "jobId": job.id,
            "state": job.state,
            "progress": job.progress,
            "error": job.error,
        }),
    );
    let updates = if job.state.is_terminal() {
        stream::empty().boxed()
    } else {
        updates
    };
    Ok(Sse::new(stream::once(async move { snapshot }).chain(updates).map(to_sse)))
}

#[cfg(test)]
mod tests {
    use crate::models::JobOptions;
    use crate::routes::{router, USER_HEADER};
    use crate::services::notifications::PushEvent;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures_util::StreamExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn get(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(USER_HEADER, user)
            .body(Body::empty())
            .unwrap()
    }

    async fn next_chunk(body: &mut axum::body::BodyDataStream) -> String {
        let bytes = body.next().await.unwrap().unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_notification_stream_acknowledges_and_delivers() {
        let state = AppState::in_memory();
        let app = router(state.clone());

        let resp = app.oneshot(get("/api/v1/notifications/stream", "u1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        let mut body = resp.into_body().into_data_stream();

        let ack = next_chunk(&mut body).await;
        assert!(ack.contains("event: connected"));
        assert!(ack.contains("retry: 3000"));

        assert_eq!(state.hub.user_channel_count("u1"), 1);
        state
            .hub
            .send_notification("u1", PushEvent::new("progress", json!({"percentage": 30})));
        let event = next_chunk(&mut body).await;
        assert!(event.contains("event: progress"));
        assert!(event.contains(r#"{"percentage":30}"#));

        drop(body);
        tokio::task::yield_now().await;
        assert_eq!(state.hub.user_channel_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_job_events_snapshot_then_updates() {
        let state = AppState::in_memory();
        let app = router(state.clone());
        let job = state
            .queue
            .create("report", json!({"user_id": "u1"}), JobOptions::default())
            .await
            .unwrap()
            .into_job();

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/v1/jobs/{}/events", job.id), "u1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body().into_data_stream();
        let snapshot = next_chunk(&mut body).await;
        assert!(snapshot.contains("event: snapshot"));
        assert!(snapshot.contains(r#""state":"created""#));

        state
            .events
            .publish(job.id, PushEvent::new("progress", json!({"percentage": 10})));
        assert!(next_chunk(&mut body).await.contains("event: progress"));

        let resp = app
            .oneshot(get(&format!("/api/v1/jobs/{}/events", job.id), "u2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
