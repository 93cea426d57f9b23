pub mod schema;

pub use schema::{Config, ReconnectConfig, StoreConfig};
