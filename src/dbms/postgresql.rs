use super::{DatabaseCredentials, DbmsProvider, ProviderError};
use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use rand::distr::{Alphanumeric, SampleString};
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tracing::*;

const PASSWORD_LENGTH: usize = 20;

#[derive(Default)]
pub struct PostgresqlProvider;

fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn quote_identifier(param: &str) -> String {
    format!("\"{}\"", param.replace('"', "\"\""))
}

fn quote_literal(param: &str) -> String {
    format!("'{}'", param.replace('\'', "''"))
}

async fn connect(
    credentials: &DatabaseCredentials,
) -> Result<tokio_postgres::Client, ProviderError> {
    let connector = MakeTlsConnector::new(TlsConnector::builder().build()?);

    let ssl_mode = if credentials.ssl {
        SslMode::Require
    } else {
        SslMode::Disable
    };

    let (client, connection) = tokio_postgres::Config::new()
        .host(&credentials.host)
        .port(credentials.port)
        .user(&credentials.user)
        .password(&credentials.password)
        .dbname(&credentials.dbname)
        .ssl_mode(ssl_mode)
        .application_name("simple-database-provisioner")
        .connect_timeout(Duration::from_secs(10))
        .connect(connector)
        .await?;

    tokio::spawn(async move {
        if let Err(error) = connection.await {
            warn!("postgresql connection error: {error}");
        }
    });

    Ok(client)
}

fn map_missing(error: tokio_postgres::Error, name: &str) -> ProviderError {
    match error.code() {
        Some(code) if *code == SqlState::INVALID_CATALOG_NAME || *code == SqlState::UNDEFINED_OBJECT => {
            ProviderError::NotFound {
                name: name.to_string(),
            }
        }
        _ => ProviderError::Postgres(error),
    }
}

#[async_trait]
impl DbmsProvider for PostgresqlProvider {
    async fn create_database_instance(
        &self,
        dbms_server_id: &str,
        admin_credentials: &DatabaseCredentials,
        database_instance_name: &str,
    ) -> Result<DatabaseCredentials, ProviderError> {
        if !is_valid_database_name(database_instance_name) {
            return Err(ProviderError::InvalidName {
                name: database_instance_name.to_string(),
            });
        }

        let client = connect(admin_credentials).await?;

        info!(
            "Creating database '{}' on server '{}'",
            database_instance_name, dbms_server_id
        );

        client
            .execute(
                &format!("CREATE DATABASE {}", quote_identifier(database_instance_name)),
                &[],
            )
            .await?;

        let password = Alphanumeric.sample_string(&mut rand::rng(), PASSWORD_LENGTH);

        client
            .execute(
                &format!(
                    "CREATE ROLE {} WITH PASSWORD {} LOGIN VALID UNTIL 'infinity'",
                    quote_identifier(database_instance_name),
                    quote_literal(&password)
                ),
                &[],
            )
            .await?;

        client
            .execute(
                &format!(
                    "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
                    quote_identifier(database_instance_name),
                    quote_identifier(database_instance_name)
                ),
                &[],
            )
            .await?;

        Ok(DatabaseCredentials {
            user: database_instance_name.to_string(),
            password,
            dbname: database_instance_name.to_string(),
            ..admin_credentials.clone()
        })
    }

    async fn exists_database_instance(
        &self,
        _dbms_server_id: &str,
        admin_credentials: &DatabaseCredentials,
        database_instance_name: &str,
    ) -> Result<bool, ProviderError> {
        let client = connect(admin_credentials).await?;

        let row = client
            .query_opt(
                "SELECT 1 FROM pg_database WHERE datname = $1",
                &[&database_instance_name],
            )
            .await?;

        Ok(row.is_some())
    }

    async fn delete_database_instance(
        &self,
        dbms_server_id: &str,
        admin_credentials: &DatabaseCredentials,
        database_instance_name: &str,
    ) -> Result<(), ProviderError> {
        let client = connect(admin_credentials).await?;

        info!(
            "Dropping database '{}' on server '{}'",
            database_instance_name, dbms_server_id
        );

        // Active sessions would block the drop.
        client
            .execute(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[&database_instance_name],
            )
            .await?;

        let mut missing = false;

        let dropped = client
            .execute(
                &format!("DROP DATABASE {}", quote_identifier(database_instance_name)),
                &[],
            )
            .await;
        match dropped.map_err(|error| map_missing(error, database_instance_name)) {
            Ok(_) => {}
            Err(error) if error.is_not_found() => missing = true,
            Err(error) => return Err(error),
        }

        // A half-completed earlier delete may have left the role behind.
        let dropped = client
            .execute(
                &format!("DROP ROLE {}", quote_identifier(database_instance_name)),
                &[],
            )
            .await;
        match dropped.map_err(|error| map_missing(error, database_instance_name)) {
            Ok(_) => {}
            Err(error) if error.is_not_found() => missing = true,
            Err(error) => return Err(error),
        }

        if missing {
            return Err(ProviderError::NotFound {
                name: database_instance_name.to_string(),
            });
        }

        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "postgresql"
    }
}
