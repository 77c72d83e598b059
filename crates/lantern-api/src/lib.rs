//! Hydration layer and HTTP read API.
//!
//! Two surfaces share one router and one hydrator:
//!
//! - a custom JSON API under `/api/...` for the bundled frontend
//! - an XRPC surface under `/xrpc/...` compatible with standard clients
//!
//! Hydration assembles denormalized views from the index tables, fanning out
//! count and viewer-state subqueries in parallel, expanding embeds one quote
//! level deep, and falling back to the missing-record fetcher when the read
//! path lands on a placeholder.

mod auth;
mod error;
pub mod hydration;
mod routes;
mod state;
mod views;
mod xrpc;

pub use auth::viewer_from_headers;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
