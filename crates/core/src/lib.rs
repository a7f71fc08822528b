pub mod config;
pub mod receipt;

pub use config::{Config, ConfigError, ModelConfig, OcrConfig, StorageConfig};
pub use receipt::{LineItem, StructuredReceipt};
