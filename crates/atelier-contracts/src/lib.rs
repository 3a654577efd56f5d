pub mod artifacts;
pub mod events;
pub mod job;
pub mod status;
pub mod summary;
pub mod telemetry;
pub mod variants;
