pub mod auth;
pub mod routes;
pub mod snapshot;
pub mod state;
pub mod ws;

pub use state::AppState;
