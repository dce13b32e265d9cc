pub mod bootstrap;
pub mod error;
pub mod proxy_engine;
pub mod state;
pub mod upstream_client;

pub use state::AppState;
