//! HTTP ingress for the swipe pipeline.
//!
//! Swipes are validated and published to the broker; stats and matches are
//! read straight from the user store.

pub mod api;
pub mod router;
pub mod state;

pub use router::build_router;
pub use state::AppState;
