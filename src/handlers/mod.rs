//! HTTP API handlers, organized by domain.

pub mod agents;
pub mod conversations;
pub mod health;
pub mod memories;
pub mod router;
pub mod search;
pub mod state;
pub mod types;

pub use router::{build_protected_routes, build_public_routes, build_router};
pub use state::{AppContext, AppState};
