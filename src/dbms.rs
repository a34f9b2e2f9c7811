use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod postgresql;

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("{field} may not be empty when creating a secret")]
    EmptyField { field: &'static str },

    #[error("secret is missing key '{key}'")]
    MissingKey { key: &'static str },

    #[error("secret key '{key}' is not valid utf-8")]
    NotUtf8 { key: &'static str },

    #[error("could not parse port: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    #[error("could not parse ssl flag: {0}")]
    InvalidSsl(#[from] std::str::ParseBoolError),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("database name '{name}' must match regex: [A-Za-z0-9_-]+")]
    InvalidName { name: String },

    #[error("database '{name}' does not exist")]
    NotFound { name: String },

    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("postgresql error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("database operation timed out")]
    Timeout,
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }
}

/// Everything an application client needs to connect to a database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub ssl: bool,
    pub dbname: String,
}

impl fmt::Display for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={}, user={}, password=****, port={}, ssl={}, database={}",
            self.host, self.user, self.port, self.ssl, self.dbname
        )
    }
}

impl DatabaseCredentials {
    /// Serialize into the key-value layout stored in a cluster Secret.
    /// Every field must be non-empty except `ssl`, which is always the
    /// literal `"true"` or `"false"`.
    pub fn to_secret_data(&self) -> Result<BTreeMap<String, Vec<u8>>, CredentialsError> {
        if self.host.is_empty() {
            return Err(CredentialsError::EmptyField { field: "host" });
        }
        if self.user.is_empty() {
            return Err(CredentialsError::EmptyField { field: "user" });
        }
        if self.password.is_empty() {
            return Err(CredentialsError::EmptyField { field: "password" });
        }
        if self.dbname.is_empty() {
            return Err(CredentialsError::EmptyField { field: "database" });
        }

        let ssl = if self.ssl { "true" } else { "false" };

        Ok(BTreeMap::from([
            ("host".to_string(), self.host.clone().into_bytes()),
            ("user".to_string(), self.user.clone().into_bytes()),
            ("password".to_string(), self.password.clone().into_bytes()),
            ("port".to_string(), self.port.to_string().into_bytes()),
            ("ssl".to_string(), ssl.as_bytes().to_vec()),
            ("database".to_string(), self.dbname.clone().into_bytes()),
        ]))
    }

    /// The exact inverse of [`DatabaseCredentials::to_secret_data`].
    pub fn from_secret_data(
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<DatabaseCredentials, CredentialsError> {
        let field = |key: &'static str| -> Result<String, CredentialsError> {
            let raw = data.get(key).ok_or(CredentialsError::MissingKey { key })?;
            String::from_utf8(raw.clone()).map_err(|_| CredentialsError::NotUtf8 { key })
        };

        Ok(DatabaseCredentials {
            host: field("host")?,
            user: field("user")?,
            password: field("password")?,
            port: field("port")?.parse()?,
            ssl: field("ssl")?.parse()?,
            dbname: field("database")?,
        })
    }
}

/// A DBMS dialect able to provision databases on a configured server.
#[async_trait]
pub trait DbmsProvider: Send + Sync {
    /// Create a database named `database_instance_name` on the server,
    /// together with a role of the same name that owns all privileges on
    /// it, and return credentials an application client can connect with.
    async fn create_database_instance(
        &self,
        dbms_server_id: &str,
        admin_credentials: &DatabaseCredentials,
        database_instance_name: &str,
    ) -> Result<DatabaseCredentials, ProviderError>;

    /// Check whether the database exists on the server. A missing
    /// database is `false`, not an error.
    async fn exists_database_instance(
        &self,
        dbms_server_id: &str,
        admin_credentials: &DatabaseCredentials,
        database_instance_name: &str,
    ) -> Result<bool, ProviderError>;

    /// Drop the database and its role. A database that is already gone
    /// is reported as [`ProviderError::NotFound`] so callers can treat
    /// it as success.
    async fn delete_database_instance(
        &self,
        dbms_server_id: &str,
        admin_credentials: &DatabaseCredentials,
        database_instance_name: &str,
    ) -> Result<(), ProviderError>;

    /// Stable identifier matched against the `type` of a configured
    /// DBMS server.
    fn type_name(&self) -> &'static str;
}

/// All registered providers, selected by DBMS type string.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn DbmsProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn DbmsProvider>>) -> ProviderRegistry {
        ProviderRegistry { providers }
    }

    pub fn get(&self, dbms_type: &str) -> Option<Arc<dyn DbmsProvider>> {
        self.providers
            .iter()
            .find(|provider| provider.type_name() == dbms_type)
            .cloned()
    }
}
