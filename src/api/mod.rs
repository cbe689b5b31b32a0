//! Thin HTTP boundary adapter. No business logic lives here.

mod routes;

pub use routes::{router, ApiState};
