use crate::cluster::ClusterGateway;
use crate::dbms::ProviderRegistry;
use crate::store::FileStore;
use crate::{Diagnostics, Metrics, Settings};
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Persistent store owning all managed records
    pub store: Arc<FileStore>,
    /// Settings
    pub settings: Arc<Settings>,
    /// Cluster gateway for Secret operations
    pub gateway: Arc<dyn ClusterGateway>,
    /// Registered DBMS providers
    pub providers: Arc<ProviderRegistry>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}
