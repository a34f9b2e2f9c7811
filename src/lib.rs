use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Settings Error: {0}")]
    SettingsError(#[source] config::ConfigError),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("CRDs are not installed in cluster")]
    MissingCrds,

    #[error("Store Error: {0}")]
    StoreError(#[from] crate::store::StoreError),

    #[error("Gateway Error: {0}")]
    GatewayError(#[from] crate::cluster::GatewayError),

    #[error("Provider Error: {0}")]
    ProviderError(#[from] crate::dbms::ProviderError),

    #[error("StdIoError")]
    StdIoError(#[from] std::io::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Managed custom resources
pub mod resources;

/// Persistent state store
pub mod store;

/// DBMS providers
pub mod dbms;

/// Cluster gateway
pub mod cluster;

/// Event ingestion
pub mod events;

/// Reconciliation state machine
pub mod reconciler;

/// Settings
mod settings;
pub use settings::{DbmsServerConfig, SecretRef, Settings};

/// State
mod state;
pub use state::*;

/// Context
mod context;
pub use context::*;
