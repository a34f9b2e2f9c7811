use crate::cluster::ClusterGateway;
use crate::dbms::ProviderRegistry;
use crate::store::FileStore;
use crate::{Context, Metrics, Settings};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics
    metrics: Arc<Metrics>,
    /// Settings
    settings: Arc<Settings>,
    /// Persistent store
    store: Arc<FileStore>,
}

impl State {
    pub fn new(settings: Settings, store: Arc<FileStore>) -> State {
        State {
            settings: Arc::new(settings),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Arc::new(Metrics::default()),
            store,
        }
    }

    /// Settings getter
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Store getter
    pub fn store(&self) -> Arc<FileStore> {
        self.store.clone()
    }

    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry).unwrap();
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a reconciler Context that can update State
    pub fn to_context(
        &self,
        gateway: Arc<dyn ClusterGateway>,
        providers: Arc<ProviderRegistry>,
    ) -> Arc<Context> {
        Arc::new(Context {
            store: self.store.clone(),
            settings: self.settings.clone(),
            gateway,
            providers,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}
