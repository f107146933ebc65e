pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod db_migrate;
pub mod error;
pub mod memory;
pub mod models;
pub mod server;
pub mod state;
pub mod store;
// re-export items if you prefer a flat structure:
pub use db::ScyllaConnector;
pub use error::Result as AppResult;
pub use memory::MemoryStore;
pub use state::StoreStateManager;
