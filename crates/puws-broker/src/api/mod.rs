//! HTTP API module.
//!
//! Exposes the broker to the remote-display gateway.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
