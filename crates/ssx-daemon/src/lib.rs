//! Webhook ingress daemon.
//!
//! Library surface so the scenario tests can compose the router in-process;
//! `main.rs` wires tracing, state, middleware, and the listener.

pub mod routes;
pub mod state;

pub use routes::{build_router, SIGNATURE_HEADER};
pub use state::AppState;
