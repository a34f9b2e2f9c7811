use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod file;
pub use file::FileStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not find instance with id: {0}")]
    InstanceNotFound(NamespaceUniqueId),

    #[error("could not find binding with id: {0}")]
    BindingNotFound(NamespaceUniqueId),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_yaml::Error),
}

/// Stable primary key of a managed record: `{namespace}-{name}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceUniqueId(String);

impl NamespaceUniqueId {
    pub fn new(namespace: &str, name: &str) -> Self {
        NamespaceUniqueId(format!("{namespace}-{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningAction {
    Create,
    Delete,
}

impl fmt::Display for ProvisioningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningAction::Create => f.write_str("create"),
            ProvisioningAction::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningPhase {
    Pending,
    Ready,
    Error,
}

impl fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningPhase::Pending => f.write_str("pending"),
            ProvisioningPhase::Ready => f.write_str("ready"),
            ProvisioningPhase::Error => f.write_str("error"),
        }
    }
}

/// One step of a record's lifecycle: what the controller is trying to do
/// and how far it got.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub action: ProvisioningAction,
    pub phase: ProvisioningPhase,
    pub message: String,
    pub last_update: DateTime<Utc>,
}

impl State {
    pub fn pending(action: ProvisioningAction) -> State {
        State {
            action,
            phase: ProvisioningPhase::Pending,
            message: String::new(),
            last_update: now(),
        }
    }

    pub fn ready(action: ProvisioningAction) -> State {
        State {
            action,
            phase: ProvisioningPhase::Ready,
            message: "ok".to_string(),
            last_update: now(),
        }
    }

    pub fn ready_with(action: ProvisioningAction, message: impl Into<String>) -> State {
        State {
            message: message.into(),
            ..State::ready(action)
        }
    }

    pub fn error(action: ProvisioningAction, message: impl Into<String>) -> State {
        State {
            action,
            phase: ProvisioningPhase::Error,
            message: message.into(),
            last_update: now(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ action: '{}', phase: '{}', message: '{}', lastUpdate: '{}' }}",
            self.action, self.phase, self.message, self.last_update
        )
    }
}

// State timestamps carry whole-second precision.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<State>,
    pub current: State,
}

impl Meta {
    pub fn new(current: State) -> Meta {
        Meta {
            previous: None,
            current,
        }
    }

    /// Roll the record forward: the old current state becomes previous.
    pub fn roll(&mut self, new_state: State) {
        self.previous = Some(std::mem::replace(&mut self.current, new_state));
    }
}

/// Desired-state record for a database on a configured DBMS server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInstance {
    pub namespace_unique_id: NamespaceUniqueId,
    pub k8s_name: String,
    pub namespace: String,
    pub dbms_server: String,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, Vec<u8>>,
    pub meta: Meta,
}

impl DatabaseInstance {
    pub fn pending_create(
        namespace: &str,
        k8s_name: &str,
        dbms_server: &str,
        database_name: &str,
    ) -> DatabaseInstance {
        DatabaseInstance {
            namespace_unique_id: NamespaceUniqueId::new(namespace, k8s_name),
            k8s_name: k8s_name.to_string(),
            namespace: namespace.to_string(),
            dbms_server: dbms_server.to_string(),
            database_name: database_name.to_string(),
            credentials: BTreeMap::new(),
            meta: Meta::new(State::pending(ProvisioningAction::Create)),
        }
    }

    /// The effective name of the database on the DBMS server:
    /// `{namespace}-{databaseName}` truncated to 54 characters, followed
    /// by the first 8 hex digits of the md5 of the untruncated name.
    pub fn prefixed_database_name(&self) -> String {
        let full_name = format!("{}-{}", self.namespace, self.database_name);
        let slice_end = full_name.len().min(54);

        format!("{}-{}", &full_name[..slice_end], md5_short(&full_name))
    }

    pub fn display(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("id".to_string(), self.namespace_unique_id.to_string()),
            ("namespace".to_string(), self.namespace.clone()),
            ("action".to_string(), self.meta.current.action.to_string()),
            ("status".to_string(), self.meta.current.phase.to_string()),
            ("message".to_string(), self.meta.current.message.clone()),
            ("databaseName".to_string(), self.database_name.clone()),
            ("dbmsServer".to_string(), self.dbms_server.clone()),
        ])
    }
}

/// Desired-state record exposing an instance's credentials as a Secret.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseBinding {
    pub namespace_unique_id: NamespaceUniqueId,
    pub k8s_name: String,
    pub namespace: String,
    pub secret_name: String,
    pub database_instance_id: NamespaceUniqueId,
    pub meta: Meta,
}

impl DatabaseBinding {
    pub fn pending_create(
        namespace: &str,
        k8s_name: &str,
        secret_name: &str,
        instance_name: &str,
    ) -> DatabaseBinding {
        DatabaseBinding {
            namespace_unique_id: NamespaceUniqueId::new(namespace, k8s_name),
            k8s_name: k8s_name.to_string(),
            namespace: namespace.to_string(),
            secret_name: secret_name.to_string(),
            database_instance_id: NamespaceUniqueId::new(namespace, instance_name),
            meta: Meta::new(State::pending(ProvisioningAction::Create)),
        }
    }

    pub fn display(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("id".to_string(), self.namespace_unique_id.to_string()),
            ("namespace".to_string(), self.namespace.clone()),
            ("action".to_string(), self.meta.current.action.to_string()),
            ("status".to_string(), self.meta.current.phase.to_string()),
            ("message".to_string(), self.meta.current.message.clone()),
            ("secret".to_string(), self.secret_name.clone()),
            ("databaseId".to_string(), self.database_instance_id.to_string()),
        ])
    }
}

fn md5_short(input: &str) -> String {
    format!("{:x}", md5::compute(input))[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_unique_id_is_namespace_dash_name() {
        let id = NamespaceUniqueId::new("team-a", "orders");
        assert_eq!(id.as_str(), "team-a-orders");
    }

    #[test]
    fn prefixed_database_name_short_names_keep_full_prefix() {
        let instance = DatabaseInstance::pending_create("shortns", "orders", "pg1", "short-db");
        assert_eq!(instance.prefixed_database_name(), "shortns-short-db-34ebb06c");
    }

    #[test]
    fn prefixed_database_name_long_names_are_truncated_with_hash_suffix() {
        let instance = DatabaseInstance::pending_create(
            "mysuperlongnamespacename",
            "orders",
            "pg1",
            "and-my-even-much-much-much-longer-even-much-much-longer-and-lon",
        );
        assert_eq!(
            instance.prefixed_database_name(),
            "mysuperlongnamespacename-and-my-even-much-much-much-lo-8157f301"
        );
    }

    #[test]
    fn prefixed_database_name_is_deterministic() {
        let a = DatabaseInstance::pending_create("ns", "a", "pg1", "db");
        let b = DatabaseInstance::pending_create("ns", "b", "pg1", "db");
        assert_eq!(a.prefixed_database_name(), b.prefixed_database_name());
    }

    #[test]
    fn meta_roll_moves_current_to_previous() {
        let mut meta = Meta::new(State::pending(ProvisioningAction::Create));
        meta.roll(State::ready(ProvisioningAction::Create));

        assert_eq!(
            meta.previous.as_ref().unwrap().phase,
            ProvisioningPhase::Pending
        );
        assert_eq!(meta.current.phase, ProvisioningPhase::Ready);
        assert_eq!(meta.current.message, "ok");
    }

    #[test]
    fn instance_display_contains_the_documented_fields() {
        let instance = DatabaseInstance::pending_create("team-a", "orders", "pg1", "orders");
        let display = instance.display();

        assert_eq!(display["id"], "team-a-orders");
        assert_eq!(display["namespace"], "team-a");
        assert_eq!(display["action"], "create");
        assert_eq!(display["status"], "pending");
        assert_eq!(display["message"], "");
        assert_eq!(display["databaseName"], "orders");
        assert_eq!(display["dbmsServer"], "pg1");
    }

    #[test]
    fn binding_display_contains_the_documented_fields() {
        let binding =
            DatabaseBinding::pending_create("team-a", "orders-bind", "orders-creds", "orders");
        let display = binding.display();

        assert_eq!(display["id"], "team-a-orders-bind");
        assert_eq!(display["namespace"], "team-a");
        assert_eq!(display["action"], "create");
        assert_eq!(display["status"], "pending");
        assert_eq!(display["secret"], "orders-creds");
        assert_eq!(display["databaseId"], "team-a-orders");
    }
}
