use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// User-declared intent to have a database created on a configured DBMS
/// server.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "SimpleDatabaseInstance",
    group = "simpledatabaseprovisioner.ecodia.de",
    version = "v1alpha1",
    namespaced,
    shortname = "sdi"
)]
#[serde(rename_all = "camelCase")]
pub struct SimpleDatabaseInstanceSpec {
    /// Logical name of a DBMS server from the controller configuration.
    pub dbms_server: String,
    #[schemars(length(min = 1, max = 63), pattern(r"^[A-Za-z0-9_-]+$"))]
    pub database_name: String,
}

/// User-declared intent to expose an existing instance's credentials as
/// a Secret in the binding's namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "SimpleDatabaseBinding",
    group = "simpledatabaseprovisioner.ecodia.de",
    version = "v1alpha1",
    namespaced,
    shortname = "sdb"
)]
#[serde(rename_all = "camelCase")]
pub struct SimpleDatabaseBindingSpec {
    /// Name of a SimpleDatabaseInstance in the same namespace.
    pub instance_name: String,
    pub secret_name: String,
}
