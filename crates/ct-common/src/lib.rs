//! ---
//! ct_section: "01-core-functionality"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Shared primitives and utilities for the service runtime."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Shared primitives for the coffee table service workspace.
//! This crate exposes configuration loading and logging bootstrap consumed by
//! the daemon and the integration tests.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, ApplicationsConfig, LoadedAppConfig, LoggingConfig, MessagingConfig, MetricsConfig,
    ServiceConfig, TransportConfig,
};
pub use logging::{init_tracing, LogFormat};
