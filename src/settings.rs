use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Reference to the cluster Secret holding the admin credentials of a
/// DBMS server, as `fromSecret` in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub secret: String,
}

/// One `dbmsServers` entry: a logical server name, the provider type used
/// to talk to it and where to find its admin credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct DbmsServerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: String,
    #[serde(alias = "fromSecret", alias = "fromsecret")]
    pub from_secret: SecretRef,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default, alias = "dbmsServers", alias = "dbmsservers")]
    pub dbms_servers: Vec<DbmsServerConfig>,

    /// File all controller state is persisted in.
    #[serde(
        default = "default_database_file",
        alias = "databaseFile",
        alias = "databasefile"
    )]
    pub database_file: String,

    /// Directory served as the web ui at `/`.
    #[serde(default = "default_html_path", alias = "htmlPath", alias = "htmlpath")]
    pub html_path: String,

    #[serde(default = "default_log_level", alias = "logLevel", alias = "loglevel")]
    pub log_level: String,

    #[serde(
        default = "default_listen_addr",
        alias = "listenAddr",
        alias = "listenaddr"
    )]
    pub listen_addr: String,
}

fn default_database_file() -> String {
    "/persistence/database.yaml".to_string()
}

fn default_html_path() -> String {
    "/app/html".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_file = std::env::var("SIMPLEDATABASEPROVISIONER_CONFIGFILE")
            .unwrap_or_else(|_| "config".to_string());

        let settings = Config::builder()
            .add_source(File::with_name(&config_file).required(false))
            .add_source(Environment::with_prefix("SIMPLEDATABASEPROVISIONER"))
            .build()?;

        settings.try_deserialize()
    }

    pub fn get_dbms_server(&self, name: &str) -> Option<&DbmsServerConfig> {
        self.dbms_servers.iter().find(|server| server.name == name)
    }
}
