//! Configuration Module
//!
//! Configuration loading for the market data hub.

mod settings;

pub use settings::{ConfigError, ConnectionSettings, HubConfig, RouterSettings, ServerSettings};
