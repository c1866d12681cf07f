//! HTTP transport and process wiring for the round coordinator.

pub mod federation;
pub mod http;

pub use federation::Federation;
pub use http::{router, AppState};
