//! Read-only HTTP status API for the relay

pub mod handlers;
pub mod server;

pub use handlers::ApiResponse;
pub use server::{router, serve, StatusState};
