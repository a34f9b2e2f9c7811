use crate::cluster::GatewayError;
use crate::dbms::{DatabaseCredentials, ProviderError};
use crate::events::Wakeups;
use crate::settings::DbmsServerConfig;
use crate::store::{
    DatabaseBinding, DatabaseInstance, NamespaceUniqueId, ProvisioningAction, ProvisioningPhase,
    State,
};
use crate::{Context, telemetry};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tracing::*;

/// Deadline for DBMS operations.
const DBMS_OP_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for cluster Secret operations.
const SECRET_OP_DEADLINE: Duration = Duration::from_secs(10);
/// The safety-net tick re-driving error and pending records.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// The dedicated reconcile worker: one full pass per wakeup or tick,
/// never more than one pass in flight.
pub async fn run(ctx: Arc<Context>, mut wakeups: Wakeups) -> crate::Result<()> {
    let mut tick = interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            _ = wakeups.recv() => debug!("received update channel event, reconciling"),
            _ = tick.tick() => debug!("tick elapsed, reconciling"),
        }

        reconcile(&ctx).await;
    }
}

/// One end-to-end pass over all non-terminal records: error instances,
/// error bindings, pending instances, pending bindings. A binding whose
/// instance turns ready earlier in the pass clears in the same pass.
#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile(ctx: &Context) {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    debug!("Checking for error and pending records");

    for phase in [ProvisioningPhase::Error, ProvisioningPhase::Pending] {
        match ctx.store.find_instances_by_phase(phase) {
            Ok(instances) => {
                for instance in instances {
                    process_instance(ctx, instance).await;
                }
            }
            Err(error) => error!("Could not load {} instances: {}", phase, error),
        }

        match ctx.store.find_bindings_by_phase(phase) {
            Ok(bindings) => {
                for binding in bindings {
                    process_binding(ctx, binding).await;
                }
            }
            Err(error) => error!("Could not load {} bindings: {}", phase, error),
        }
    }
}

async fn process_instance(ctx: &Context, instance: DatabaseInstance) {
    let id = instance.namespace_unique_id.clone();
    let action = instance.meta.current.action;

    let Some(server) = ctx.settings.get_dbms_server(&instance.dbms_server) else {
        let message = format!(
            "Could not find DBMS server with name '{}' in config",
            instance.dbms_server
        );
        fail_instance(ctx, &id, action, "config", message);
        return;
    };

    let Some(provider) = ctx.providers.get(&server.server_type) else {
        let message = format!(
            "Could not find provider for dbms type: {}",
            server.server_type
        );
        fail_instance(ctx, &id, action, "provider", message);
        return;
    };

    match action {
        ProvisioningAction::Create => {
            let credentials = match admin_credentials(ctx, server).await {
                Ok(credentials) => credentials,
                Err(error) => {
                    warn!("Could not read admin credentials: {}", error);
                    let message = format!(
                        "Could not get database credentials for server '{}'",
                        server.name
                    );
                    fail_instance(ctx, &id, action, "credentials", message);
                    return;
                }
            };

            let database_name = instance.prefixed_database_name();

            let exists = match dbms_call(provider.exists_database_instance(
                &server.name,
                &credentials,
                &database_name,
            ))
            .await
            {
                Ok(exists) => exists,
                Err(error) => {
                    let message = format!(
                        "Could not check if database exists for server '{}' - {}",
                        server.name, error
                    );
                    fail_instance(ctx, &id, action, "provider", message);
                    return;
                }
            };

            if exists {
                info!("Database already exists for instance: {}", id);
                let state =
                    State::ready_with(action, "Database already existed, keeping existing db");
                if let Err(error) = ctx.store.update_instance_state(&id, state) {
                    error!("There was an error updating state of instance '{}': {}", id, error);
                }
                return;
            }

            let instance_credentials = match dbms_call(provider.create_database_instance(
                &server.name,
                &credentials,
                &database_name,
            ))
            .await
            {
                Ok(instance_credentials) => instance_credentials,
                Err(error) => {
                    let message = format!(
                        "Could not create database instance '{}': {}",
                        instance.k8s_name, error
                    );
                    fail_instance(ctx, &id, action, "provider", message);
                    return;
                }
            };

            let secret_data = match instance_credentials.to_secret_data() {
                Ok(secret_data) => secret_data,
                Err(error) => {
                    let message = format!(
                        "Could not create secret data from credentials '{}': {}",
                        instance.k8s_name, error
                    );
                    fail_instance(ctx, &id, action, "credentials", message);
                    return;
                }
            };

            if let Err(error) = ctx.store.update_instance_credentials(&id, secret_data) {
                let message = format!(
                    "Could not update database credentials for instance '{}': {}",
                    instance.k8s_name, error
                );
                fail_instance(ctx, &id, action, "store", message);
                return;
            }

            if let Err(error) = ctx.store.update_instance_state(&id, State::ready(action)) {
                error!("There was an error updating state of instance '{}': {}", id, error);
            }

            info!(
                "Successfully created instance: namespace={}, instance={}",
                instance.namespace, instance.k8s_name
            );
        }
        ProvisioningAction::Delete => {
            let credentials = match admin_credentials(ctx, server).await {
                Ok(credentials) => credentials,
                Err(error) => {
                    warn!("Could not read admin credentials: {}", error);
                    let message = format!(
                        "Could not get database credentials for server '{}'",
                        server.name
                    );
                    fail_instance(ctx, &id, action, "credentials", message);
                    return;
                }
            };

            match dbms_call(provider.delete_database_instance(
                &server.name,
                &credentials,
                &instance.prefixed_database_name(),
            ))
            .await
            {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    info!("Database was already gone, proceeding with delete of '{}'", id);
                }
                Err(error) => {
                    let message = format!("Could not delete database instance '{}': {}", id, error);
                    fail_instance(ctx, &id, action, "provider", message);
                    return;
                }
            }

            if let Err(error) = ctx.store.delete_instance(&id) {
                error!("There was an error deleting instance '{}': {}", id, error);
                return;
            }

            info!("Successfully deleted instance: {}", id);
        }
    }
}

async fn process_binding(ctx: &Context, binding: DatabaseBinding) {
    let id = binding.namespace_unique_id.clone();
    let action = binding.meta.current.action;

    match action {
        ProvisioningAction::Create => {
            let instance = match ctx.store.find_instance_by_id(&binding.database_instance_id) {
                Ok(instance) => instance,
                Err(_) => {
                    let message = format!(
                        "Could not find database instance with id: {}",
                        binding.database_instance_id
                    );
                    fail_binding(ctx, &id, action, "missing_instance", message);
                    return;
                }
            };

            if instance.meta.current.phase != ProvisioningPhase::Ready {
                let message = format!(
                    "Database instance '{}' is not ready yet",
                    binding.database_instance_id
                );
                fail_binding(ctx, &id, action, "instance_not_ready", message);
                return;
            }

            match secret_call(ctx.gateway.create_secret(
                &binding.namespace,
                &binding.secret_name,
                instance.credentials.clone(),
            ))
            .await
            {
                Ok(()) => {}
                Err(error) if error.is_already_exists() => {
                    info!("Secret already exists for binding: {}", id);
                    let state =
                        State::ready_with(action, "Secret already existed, using existing secret");
                    if let Err(error) = ctx.store.update_binding_state(&id, state) {
                        error!("There was an error updating state of binding '{}': {}", id, error);
                    }
                    return;
                }
                Err(error) => {
                    let message = format!("Could not create secret for binding '{}': {}", id, error);
                    fail_binding(ctx, &id, action, "gateway", message);
                    return;
                }
            }

            if let Err(error) = ctx.store.update_binding_state(&id, State::ready(action)) {
                error!("There was an error updating state of binding '{}': {}", id, error);
            }

            info!(
                "Successfully created binding: namespace={}, binding={}",
                binding.namespace, id
            );
        }
        ProvisioningAction::Delete => {
            match secret_call(
                ctx.gateway
                    .delete_secret(&binding.namespace, &binding.secret_name),
            )
            .await
            {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    info!("Secret was already gone, proceeding with delete of '{}'", id);
                }
                Err(error) => {
                    let message = format!("Could not delete binding '{}': {}", id, error);
                    fail_binding(ctx, &id, action, "gateway", message);
                    return;
                }
            }

            if let Err(error) = ctx.store.delete_binding(&id) {
                error!("There was an error deleting binding '{}': {}", id, error);
                return;
            }

            info!("Successfully deleted binding: {}", id);
        }
    }
}

async fn admin_credentials(
    ctx: &Context,
    server: &DbmsServerConfig,
) -> Result<DatabaseCredentials, String> {
    let data = secret_call(
        ctx.gateway
            .read_secret(&server.from_secret.namespace, &server.from_secret.secret),
    )
    .await
    .map_err(|error| error.to_string())?;

    DatabaseCredentials::from_secret_data(&data).map_err(|error| error.to_string())
}

async fn dbms_call<T>(
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    timeout(DBMS_OP_DEADLINE, fut)
        .await
        .unwrap_or(Err(ProviderError::Timeout))
}

async fn secret_call<T>(
    fut: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    timeout(SECRET_OP_DEADLINE, fut)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}

fn fail_instance(
    ctx: &Context,
    id: &NamespaceUniqueId,
    action: ProvisioningAction,
    error_kind: &str,
    message: String,
) {
    error!("{}", message);
    ctx.metrics
        .reconcile
        .set_failure("instance", id.as_str(), error_kind);

    if let Err(error) = ctx.store.update_instance_state(id, State::error(action, message)) {
        error!("There was an error updating state of instance '{}': {}", id, error);
    }
}

fn fail_binding(
    ctx: &Context,
    id: &NamespaceUniqueId,
    action: ProvisioningAction,
    error_kind: &str,
    message: String,
) {
    error!("{}", message);
    ctx.metrics
        .reconcile
        .set_failure("binding", id.as_str(), error_kind);

    if let Err(error) = ctx.store.update_binding_state(id, State::error(action, message)) {
        error!("There was an error updating state of binding '{}': {}", id, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterGateway, SecretData};
    use crate::dbms::{DbmsProvider, ProviderRegistry};
    use crate::settings::{SecretRef, Settings};
    use crate::store::FileStore;
    use crate::{Diagnostics, Metrics};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct FakeGateway {
        secrets: Mutex<BTreeMap<(String, String), SecretData>>,
    }

    impl FakeGateway {
        fn insert(&self, namespace: &str, name: &str, data: SecretData) {
            self.secrets
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), data);
        }

        fn get(&self, namespace: &str, name: &str) -> Option<SecretData> {
            self.secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl ClusterGateway for FakeGateway {
        async fn read_secret(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<SecretData, GatewayError> {
            self.get(namespace, name)
                .ok_or_else(|| GatewayError::SecretNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
        }

        async fn create_secret(
            &self,
            namespace: &str,
            name: &str,
            data: SecretData,
        ) -> Result<(), GatewayError> {
            let mut secrets = self.secrets.lock().unwrap();
            let key = (namespace.to_string(), name.to_string());

            if secrets.contains_key(&key) {
                return Err(GatewayError::SecretAlreadyExists {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }

            secrets.insert(key, data);
            Ok(())
        }

        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
            let mut secrets = self.secrets.lock().unwrap();
            let key = (namespace.to_string(), name.to_string());

            if secrets.remove(&key).is_none() {
                return Err(GatewayError::SecretNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }

            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        databases: Mutex<BTreeSet<String>>,
    }

    impl FakeProvider {
        fn seed(&self, name: &str) {
            self.databases.lock().unwrap().insert(name.to_string());
        }

        fn has(&self, name: &str) -> bool {
            self.databases.lock().unwrap().contains(name)
        }
    }

    #[async_trait]
    impl DbmsProvider for FakeProvider {
        async fn create_database_instance(
            &self,
            _dbms_server_id: &str,
            admin_credentials: &DatabaseCredentials,
            database_instance_name: &str,
        ) -> Result<DatabaseCredentials, ProviderError> {
            self.databases
                .lock()
                .unwrap()
                .insert(database_instance_name.to_string());

            Ok(DatabaseCredentials {
                user: database_instance_name.to_string(),
                password: "generated-password-20".to_string(),
                dbname: database_instance_name.to_string(),
                ..admin_credentials.clone()
            })
        }

        async fn exists_database_instance(
            &self,
            _dbms_server_id: &str,
            _admin_credentials: &DatabaseCredentials,
            database_instance_name: &str,
        ) -> Result<bool, ProviderError> {
            Ok(self.has(database_instance_name))
        }

        async fn delete_database_instance(
            &self,
            _dbms_server_id: &str,
            _admin_credentials: &DatabaseCredentials,
            database_instance_name: &str,
        ) -> Result<(), ProviderError> {
            if !self.databases.lock().unwrap().remove(database_instance_name) {
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

    fn admin_secret() -> SecretData {
        DatabaseCredentials {
            host: "localhost".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            port: 5432,
            ssl: false,
            dbname: "postgres".to_string(),
        }
        .to_secret_data()
        .unwrap()
    }

    fn settings() -> Settings {
        Settings {
            dbms_servers: vec![DbmsServerConfig {
                name: "pg1".to_string(),
                server_type: "postgresql".to_string(),
                from_secret: SecretRef {
                    namespace: "default".to_string(),
                    secret: "pg1-admin".to_string(),
                },
            }],
            database_file: String::new(),
            html_path: String::new(),
            log_level: "info".to_string(),
            listen_addr: String::new(),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: Context,
        gateway: Arc<FakeGateway>,
        provider: Arc<FakeProvider>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("database.yaml")));
        let gateway = Arc::new(FakeGateway::default());
        let provider = Arc::new(FakeProvider::default());

        let ctx = Context {
            store,
            settings: Arc::new(settings()),
            gateway: gateway.clone(),
            providers: Arc::new(ProviderRegistry::new(vec![
                provider.clone() as Arc<dyn DbmsProvider>
            ])),
            metrics: Arc::new(Metrics::default()),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
        };

        Harness {
            _dir: dir,
            ctx,
            gateway,
            provider,
        }
    }

    fn orders_instance() -> DatabaseInstance {
        DatabaseInstance::pending_create("team-a", "orders", "pg1", "orders")
    }

    fn orders_binding() -> DatabaseBinding {
        DatabaseBinding::pending_create("team-a", "orders-bind", "orders-creds", "orders")
    }

    #[tokio::test]
    async fn creates_database_and_secret_in_one_pass() {
        let h = harness();
        h.gateway.insert("default", "pg1-admin", admin_secret());

        let instance = orders_instance();
        let database_name = instance.prefixed_database_name();
        h.ctx.store.add_instance(instance).unwrap();
        h.ctx.store.add_binding(orders_binding()).unwrap();

        reconcile(&h.ctx).await;

        assert!(h.provider.has(&database_name));

        let instance = h
            .ctx
            .store
            .find_instance_by_id(&NamespaceUniqueId::new("team-a", "orders"))
            .unwrap();
        assert_eq!(instance.meta.current.action, ProvisioningAction::Create);
        assert_eq!(instance.meta.current.phase, ProvisioningPhase::Ready);
        assert_eq!(instance.credentials.len(), 6);

        let bindings = h.ctx.store.find_all_bindings().unwrap();
        assert_eq!(bindings[0].meta.current.phase, ProvisioningPhase::Ready);

        let secret = h.gateway.get("team-a", "orders-creds").unwrap();
        for key in ["host", "user", "password", "port", "ssl", "database"] {
            assert!(secret.contains_key(key), "missing key {key}");
        }
        assert_eq!(secret["database"], database_name.clone().into_bytes());
    }

    #[tokio::test]
    async fn existing_database_is_adopted_not_recreated() {
        let h = harness();
        h.gateway.insert("default", "pg1-admin", admin_secret());

        let instance = orders_instance();
        h.provider.seed(&instance.prefixed_database_name());
        h.ctx.store.add_instance(instance).unwrap();

        reconcile(&h.ctx).await;

        let instance = h
            .ctx
            .store
            .find_instance_by_id(&NamespaceUniqueId::new("team-a", "orders"))
            .unwrap();
        assert_eq!(instance.meta.current.phase, ProvisioningPhase::Ready);
        assert_eq!(
            instance.meta.current.message,
            "Database already existed, keeping existing db"
        );
    }

    #[tokio::test]
    async fn missing_admin_secret_errors_then_recovers() {
        let h = harness();
        h.ctx.store.add_instance(orders_instance()).unwrap();

        reconcile(&h.ctx).await;

        let id = NamespaceUniqueId::new("team-a", "orders");
        let instance = h.ctx.store.find_instance_by_id(&id).unwrap();
        assert_eq!(instance.meta.current.phase, ProvisioningPhase::Error);
        assert!(instance.meta.current.message.contains("credentials"));

        h.gateway.insert("default", "pg1-admin", admin_secret());
        reconcile(&h.ctx).await;

        let instance = h.ctx.store.find_instance_by_id(&id).unwrap();
        assert_eq!(instance.meta.current.phase, ProvisioningPhase::Ready);
        assert_eq!(
            instance.meta.previous.as_ref().unwrap().phase,
            ProvisioningPhase::Error
        );
    }

    #[tokio::test]
    async fn binding_waits_until_its_instance_is_ready() {
        let h = harness();
        h.gateway.insert("default", "pg1-admin", admin_secret());
        h.ctx.store.add_binding(orders_binding()).unwrap();

        reconcile(&h.ctx).await;

        let binding_id = NamespaceUniqueId::new("team-a", "orders-bind");
        let bindings = h.ctx.store.find_all_bindings().unwrap();
        assert_eq!(bindings[0].meta.current.phase, ProvisioningPhase::Error);
        assert!(bindings[0].meta.current.message.contains("team-a-orders"));

        h.ctx.store.add_instance(orders_instance()).unwrap();

        // One pass turns the instance ready, the next clears the binding.
        reconcile(&h.ctx).await;
        reconcile(&h.ctx).await;

        let bindings = h.ctx.store.find_all_bindings().unwrap();
        assert_eq!(bindings[0].namespace_unique_id, binding_id);
        assert_eq!(bindings[0].meta.current.phase, ProvisioningPhase::Ready);
        assert!(h.gateway.get("team-a", "orders-creds").is_some());
    }

    #[tokio::test]
    async fn delete_of_already_gone_database_removes_the_record() {
        let h = harness();
        h.gateway.insert("default", "pg1-admin", admin_secret());

        let id = NamespaceUniqueId::new("team-a", "orders");
        h.ctx.store.add_instance(orders_instance()).unwrap();
        h.ctx
            .store
            .update_instance_state(&id, State::pending(ProvisioningAction::Delete))
            .unwrap();

        reconcile(&h.ctx).await;

        assert!(h.ctx.store.find_all_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_drops_the_database_and_removes_the_record() {
        let h = harness();
        h.gateway.insert("default", "pg1-admin", admin_secret());

        let instance = orders_instance();
        let database_name = instance.prefixed_database_name();
        let id = instance.namespace_unique_id.clone();
        h.provider.seed(&database_name);
        h.ctx.store.add_instance(instance).unwrap();
        h.ctx
            .store
            .update_instance_state(&id, State::pending(ProvisioningAction::Delete))
            .unwrap();

        reconcile(&h.ctx).await;

        assert!(!h.provider.has(&database_name));
        assert!(h.ctx.store.find_all_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_dbms_server_is_a_user_fixable_error_state() {
        let h = harness();
        h.ctx
            .store
            .add_instance(DatabaseInstance::pending_create(
                "team-a", "orders", "unknown", "orders",
            ))
            .unwrap();

        reconcile(&h.ctx).await;

        let instance = h
            .ctx
            .store
            .find_instance_by_id(&NamespaceUniqueId::new("team-a", "orders"))
            .unwrap();
        assert_eq!(instance.meta.current.phase, ProvisioningPhase::Error);
        assert!(
            instance
                .meta
                .current
                .message
                .contains("Could not find DBMS server")
        );
    }

    #[tokio::test]
    async fn binding_create_adopts_an_existing_secret() {
        let h = harness();
        h.gateway.insert("default", "pg1-admin", admin_secret());
        h.gateway.insert("team-a", "orders-creds", admin_secret());

        let id = NamespaceUniqueId::new("team-a", "orders");
        h.ctx.store.add_instance(orders_instance()).unwrap();
        h.ctx
            .store
            .update_instance_credentials(&id, admin_secret())
            .unwrap();
        h.ctx
            .store
            .update_instance_state(&id, State::ready(ProvisioningAction::Create))
            .unwrap();
        h.ctx.store.add_binding(orders_binding()).unwrap();

        reconcile(&h.ctx).await;

        let bindings = h.ctx.store.find_all_bindings().unwrap();
        assert_eq!(bindings[0].meta.current.phase, ProvisioningPhase::Ready);
        assert_eq!(
            bindings[0].meta.current.message,
            "Secret already existed, using existing secret"
        );
    }

    #[tokio::test]
    async fn binding_delete_with_missing_secret_still_removes_the_record() {
        let h = harness();

        let id = NamespaceUniqueId::new("team-a", "orders-bind");
        h.ctx.store.add_binding(orders_binding()).unwrap();
        h.ctx
            .store
            .update_binding_state(&id, State::pending(ProvisioningAction::Delete))
            .unwrap();

        reconcile(&h.ctx).await;

        assert!(h.ctx.store.find_all_bindings().unwrap().is_empty());
    }
}
