//! Core value types shared across the compiler and scheduler.

mod event;
mod status;

pub use event::RunEvent;
pub use status::JobStatus;
