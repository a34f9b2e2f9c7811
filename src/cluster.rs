use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use thiserror::Error;

pub type SecretData = BTreeMap<String, Vec<u8>>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("secret '{namespace}/{name}' not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("secret '{namespace}/{name}' already exists")]
    SecretAlreadyExists { namespace: String, name: String },

    #[error("kube error: {0}")]
    Kube(#[source] kube::Error),

    #[error("secret operation timed out")]
    Timeout,
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::SecretNotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, GatewayError::SecretAlreadyExists { .. })
    }
}

/// Thin interface over the hosting cluster, namespace scoped. Everything
/// the reconciler needs from the cluster goes through this trait so it
/// can be faked in tests.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn read_secret(&self, namespace: &str, name: &str) -> Result<SecretData, GatewayError>;

    /// Create a Secret. An existing Secret of the same name surfaces as
    /// [`GatewayError::SecretAlreadyExists`].
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
    ) -> Result<(), GatewayError>;

    /// Delete a Secret. A missing Secret surfaces as
    /// [`GatewayError::SecretNotFound`].
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;
}

pub struct KubeGateway {
    client: kube::Client,
}

impl KubeGateway {
    pub fn new(client: kube::Client) -> KubeGateway {
        KubeGateway { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn classify(error: kube::Error, namespace: &str, name: &str) -> GatewayError {
    if let kube::Error::Api(response) = &error {
        if response.code == 404 {
            return GatewayError::SecretNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
        }
        if response.code == 409 {
            return GatewayError::SecretAlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
        }
    }

    GatewayError::Kube(error)
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn read_secret(&self, namespace: &str, name: &str) -> Result<SecretData, GatewayError> {
        let secret = self
            .secrets(namespace)
            .get(name)
            .await
            .map_err(|error| classify(error, namespace, name))?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
    ) -> Result<(), GatewayError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Default::default()
        };

        self.secrets(namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|error| classify(error, namespace, name))?;

        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|error| classify(error, namespace, name))?;

        Ok(())
    }
}
