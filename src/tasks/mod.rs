//! Background tasks and job handlers

pub mod heartbeat;
pub mod maintenance;
pub mod schema_rebuild;
pub mod scheduler;
