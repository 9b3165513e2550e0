//! Core services: job queue, worker, training pipeline, notification fan-out

pub mod notifications;
pub mod queue;
pub mod training;
pub mod worker;
