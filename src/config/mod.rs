pub mod schema;

pub use schema::{Config, DedupConfig, DeliveryConfig, GatewayConfig, JobsConfig, StorageConfig};
