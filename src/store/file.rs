use super::{
    DatabaseBinding, DatabaseInstance, NamespaceUniqueId, ProvisioningPhase, State, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::*;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreData {
    database_instances: Vec<DatabaseInstance>,
    database_bindings: Vec<DatabaseBinding>,
    processed_events: Vec<String>,
}

/// Single-writer store backed by one YAML document on disk.
///
/// Every operation takes the store lock, loads the document, mutates it
/// and writes it back, so each operation is atomic with respect to all
/// others. The lock is never held while talking to the DBMS or the
/// cluster; callers only see snapshots.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> FileStore {
        FileStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<StoreData, StoreError> {
        if !self.path.exists() {
            info!("Store file '{}' not found, creating it", self.path.display());
            self.save(&StoreData::default())?;
        }

        let raw = std::fs::read_to_string(&self.path)?;

        Ok(serde_yaml::from_str(&raw)?)
    }

    fn save(&self, data: &StoreData) -> Result<(), StoreError> {
        let raw = serde_yaml::to_string(data)?;
        std::fs::write(&self.path, raw)?;

        Ok(())
    }

    // ---- instances ----

    /// Add an instance record. A redelivered record with the same id and
    /// the same current action is a no-op; a record with a differing
    /// action replaces the stale one, collapsing fast add/delete/add
    /// sequences into the latest declared lifecycle.
    pub fn add_instance(&self, instance: DatabaseInstance) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        if let Some(position) = data
            .database_instances
            .iter()
            .position(|existing| existing.namespace_unique_id == instance.namespace_unique_id)
        {
            let existing = &data.database_instances[position];
            if existing.meta.current.action == instance.meta.current.action {
                debug!(
                    "Instance with id '{}' already exists, skipping action '{}'",
                    instance.namespace_unique_id, instance.meta.current.action
                );
                return Ok(());
            }
            data.database_instances.remove(position);
        }

        data.database_instances.push(instance);
        self.save(&data)
    }

    pub fn update_instance_state(
        &self,
        id: &NamespaceUniqueId,
        new_state: State,
    ) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        let instance = data
            .database_instances
            .iter_mut()
            .find(|instance| &instance.namespace_unique_id == id)
            .ok_or_else(|| StoreError::InstanceNotFound(id.clone()))?;

        instance.meta.roll(new_state);
        debug!("Updated state for instance with id '{}': {}", id, instance.meta.current);

        self.save(&data)
    }

    pub fn update_instance_credentials(
        &self,
        id: &NamespaceUniqueId,
        credentials: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        let instance = data
            .database_instances
            .iter_mut()
            .find(|instance| &instance.namespace_unique_id == id)
            .ok_or_else(|| StoreError::InstanceNotFound(id.clone()))?;

        instance.credentials = credentials;

        self.save(&data)
    }

    /// Remove an instance record. Removing an absent record is not an
    /// error.
    pub fn delete_instance(&self, id: &NamespaceUniqueId) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        data.database_instances
            .retain(|instance| &instance.namespace_unique_id != id);

        self.save(&data)
    }

    pub fn find_instance_by_id(
        &self,
        id: &NamespaceUniqueId,
    ) -> Result<DatabaseInstance, StoreError> {
        let _guard = self.guard();
        let data = self.load()?;

        data.database_instances
            .into_iter()
            .find(|instance| &instance.namespace_unique_id == id)
            .ok_or_else(|| StoreError::InstanceNotFound(id.clone()))
    }

    pub fn find_all_instances(&self) -> Result<Vec<DatabaseInstance>, StoreError> {
        let _guard = self.guard();

        Ok(self.load()?.database_instances)
    }

    pub fn find_instances_by_phase(
        &self,
        phase: ProvisioningPhase,
    ) -> Result<Vec<DatabaseInstance>, StoreError> {
        let _guard = self.guard();
        let data = self.load()?;

        Ok(data
            .database_instances
            .into_iter()
            .filter(|instance| instance.meta.current.phase == phase)
            .collect())
    }

    // ---- bindings ----

    /// Same add semantics as [`FileStore::add_instance`].
    pub fn add_binding(&self, binding: DatabaseBinding) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        if let Some(position) = data
            .database_bindings
            .iter()
            .position(|existing| existing.namespace_unique_id == binding.namespace_unique_id)
        {
            let existing = &data.database_bindings[position];
            if existing.meta.current.action == binding.meta.current.action {
                debug!(
                    "Binding with id '{}' already exists, skipping action '{}'",
                    binding.namespace_unique_id, binding.meta.current.action
                );
                return Ok(());
            }
            data.database_bindings.remove(position);
        }

        data.database_bindings.push(binding);
        self.save(&data)
    }

    pub fn update_binding_state(
        &self,
        id: &NamespaceUniqueId,
        new_state: State,
    ) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        let binding = data
            .database_bindings
            .iter_mut()
            .find(|binding| &binding.namespace_unique_id == id)
            .ok_or_else(|| StoreError::BindingNotFound(id.clone()))?;

        binding.meta.roll(new_state);
        debug!("Updated state for binding with id '{}': {}", id, binding.meta.current);

        self.save(&data)
    }

    pub fn delete_binding(&self, id: &NamespaceUniqueId) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        data.database_bindings
            .retain(|binding| &binding.namespace_unique_id != id);

        self.save(&data)
    }

    pub fn find_all_bindings(&self) -> Result<Vec<DatabaseBinding>, StoreError> {
        let _guard = self.guard();

        Ok(self.load()?.database_bindings)
    }

    pub fn find_bindings_by_phase(
        &self,
        phase: ProvisioningPhase,
    ) -> Result<Vec<DatabaseBinding>, StoreError> {
        let _guard = self.guard();
        let data = self.load()?;

        Ok(data
            .database_bindings
            .into_iter()
            .filter(|binding| binding.meta.current.phase == phase)
            .collect())
    }

    // ---- processed events ----

    pub fn was_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard();
        let data = self.load()?;

        Ok(data.processed_events.iter().any(|id| id == event_id))
    }

    pub fn mark_processed(&self, event_id: &str) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut data = self.load()?;

        if data.processed_events.iter().any(|id| id == event_id) {
            return Ok(());
        }

        data.processed_events.push(event_id.to_string());
        self.save(&data)
    }
}
