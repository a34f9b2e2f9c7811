use crate::resources::{SimpleDatabaseBinding, SimpleDatabaseInstance};
use crate::store::{
    DatabaseBinding, DatabaseInstance, FileStore, NamespaceUniqueId, ProvisioningAction, State,
};
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::*;

/// Coalescing wakeup for the reconcile worker.
///
/// A single-slot channel: a send into the full slot is dropped, so any
/// burst of notifications collapses into at most one queued reconcile
/// pass after the one currently running.
#[derive(Clone)]
pub struct Signal {
    tx: mpsc::Sender<()>,
}

/// Receive half of [`Signal`], owned by the reconcile worker.
pub struct Wakeups {
    rx: mpsc::Receiver<()>,
}

impl Signal {
    pub fn new() -> (Signal, Wakeups) {
        let (tx, rx) = mpsc::channel(1);
        (Signal { tx }, Wakeups { rx })
    }

    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => debug!("notify: wrote into update channel"),
            Err(_) => debug!("notify: update channel full, skipping"),
        }
    }
}

impl Wakeups {
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Translates cluster add/delete notifications into persisted
/// desired-state records, deduplicated by event UID.
pub struct EventIngester {
    store: Arc<FileStore>,
    signal: Signal,
}

impl EventIngester {
    pub fn new(store: Arc<FileStore>, signal: Signal) -> EventIngester {
        EventIngester { store, signal }
    }

    pub fn instance_added(&self, instance: &SimpleDatabaseInstance) {
        let Some((namespace, uid)) = identity(instance) else {
            return;
        };
        let name = instance.name_any();
        let event_id = format!("ADD-{uid}");

        info!(
            "Received instance add event '{}': {} in namespace={}",
            event_id, name, namespace
        );

        if self.was_processed(&event_id, &name) {
            return;
        }

        let record = DatabaseInstance::pending_create(
            &namespace,
            &name,
            &instance.spec.dbms_server,
            &instance.spec.database_name,
        );

        if let Err(error) = self.store.add_instance(record) {
            error!("Could not create database instance '{}': {}", name, error);
        }

        self.finish(&event_id);
    }

    pub fn instance_deleted(&self, instance: &SimpleDatabaseInstance) {
        let Some((namespace, uid)) = identity(instance) else {
            return;
        };
        let name = instance.name_any();
        let event_id = format!("DELETE-{uid}");

        info!(
            "Received instance delete event '{}': {} in namespace={}",
            event_id, name, namespace
        );

        if self.was_processed(&event_id, &name) {
            return;
        }

        let id = NamespaceUniqueId::new(&namespace, &name);
        if let Err(error) = self
            .store
            .update_instance_state(&id, State::pending(ProvisioningAction::Delete))
        {
            error!("Could not mark database instance '{}' for deletion: {}", id, error);
        }

        self.finish(&event_id);
    }

    pub fn binding_added(&self, binding: &SimpleDatabaseBinding) {
        let Some((namespace, uid)) = identity(binding) else {
            return;
        };
        let name = binding.name_any();
        let event_id = format!("ADD-{uid}");

        info!(
            "Received binding add event '{}': {} in namespace={}",
            event_id, name, namespace
        );

        if self.was_processed(&event_id, &name) {
            return;
        }

        let record = DatabaseBinding::pending_create(
            &namespace,
            &name,
            &binding.spec.secret_name,
            &binding.spec.instance_name,
        );

        if let Err(error) = self.store.add_binding(record) {
            error!("Could not create database binding '{}': {}", name, error);
        }

        self.finish(&event_id);
    }

    pub fn binding_deleted(&self, binding: &SimpleDatabaseBinding) {
        let Some((namespace, uid)) = identity(binding) else {
            return;
        };
        let name = binding.name_any();
        let event_id = format!("DELETE-{uid}");

        info!(
            "Received binding delete event '{}': {} in namespace={}",
            event_id, name, namespace
        );

        if self.was_processed(&event_id, &name) {
            return;
        }

        let id = NamespaceUniqueId::new(&namespace, &name);
        if let Err(error) = self
            .store
            .update_binding_state(&id, State::pending(ProvisioningAction::Delete))
        {
            error!("Could not mark database binding '{}' for deletion: {}", id, error);
        }

        self.finish(&event_id);
    }

    fn was_processed(&self, event_id: &str, name: &str) -> bool {
        match self.store.was_processed(event_id) {
            Ok(true) => {
                info!("Event '{}' - '{}' was already processed, skipping", event_id, name);
                true
            }
            Ok(false) => false,
            Err(error) => {
                // Process anyway; every downstream write is idempotent.
                error!("Could not check processed events: {}", error);
                false
            }
        }
    }

    fn finish(&self, event_id: &str) {
        if let Err(error) = self.store.mark_processed(event_id) {
            error!("Could not mark event '{}' as processed: {}", event_id, error);
        }

        self.signal.notify();
    }
}

fn identity<R: ResourceExt>(resource: &R) -> Option<(String, String)> {
    let Some(namespace) = resource.namespace() else {
        warn!("Skipping event for '{}': no namespace", resource.name_any());
        return None;
    };
    let Some(uid) = resource.uid() else {
        warn!("Skipping event for '{}': no uid", resource.name_any());
        return None;
    };

    Some((namespace, uid))
}
