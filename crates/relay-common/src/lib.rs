//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared primitives and utilities for the relay services."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
//! Shared primitives for the relay workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by every service binary.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BroadcasterConfig, BrokerConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    PublisherConfig, RelayConfig, TransformConfig, TransformerConfig,
};
pub use logging::{init_tracing, LogFormat};
