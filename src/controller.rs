use crate::cluster::{ClusterGateway, KubeGateway};
use crate::dbms::{DbmsProvider, ProviderRegistry, postgresql::PostgresqlProvider};
use crate::events::{EventIngester, Signal};
use crate::resources::{SimpleDatabaseBinding, SimpleDatabaseInstance};
use crate::{Error, State, reconciler};
use futures::{StreamExt, pin_mut};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event, watcher};
use std::sync::Arc;
use tracing::*;

/// Initialize the controller and shared state (given the crds are installed)
pub async fn run(state: State) -> Result<(), Error> {
    let kube_client = Client::try_default().await.map_err(Error::KubeError)?;

    let instances = Api::<SimpleDatabaseInstance>::all(kube_client.clone());
    let bindings = Api::<SimpleDatabaseBinding>::all(kube_client.clone());

    let probe = ListParams::default().limit(1);
    if instances.list(&probe).await.is_err() || bindings.list(&probe).await.is_err() {
        return Err(Error::MissingCrds);
    }
    info!("CRDs for SimpleDatabaseInstance and SimpleDatabaseBinding are installed!");

    let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::new(kube_client.clone()));
    let providers = Arc::new(ProviderRegistry::new(vec![
        Arc::new(PostgresqlProvider) as Arc<dyn DbmsProvider>,
    ]));

    let (signal, wakeups) = Signal::new();
    let ingester = Arc::new(EventIngester::new(state.store(), signal));
    let ctx = state.to_context(gateway, providers);

    info!("Starting controller");

    tokio::try_join!(
        reconciler::run(ctx, wakeups),
        watch_instances(instances, ingester.clone()),
        watch_bindings(bindings, ingester.clone()),
    )?;

    Ok(())
}

// Update notifications re-deliver the same uid and are absorbed by the
// ingester's processed-event set, so only add and delete get through.
async fn watch_instances(
    api: Api<SimpleDatabaseInstance>,
    ingester: Arc<EventIngester>,
) -> Result<(), Error> {
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(instance)) | Ok(Event::InitApply(instance)) => {
                ingester.instance_added(&instance)
            }
            Ok(Event::Delete(instance)) => ingester.instance_deleted(&instance),
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(error) => warn!("instance watch error: {error}"),
        }
    }

    Ok(())
}

async fn watch_bindings(
    api: Api<SimpleDatabaseBinding>,
    ingester: Arc<EventIngester>,
) -> Result<(), Error> {
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(binding)) | Ok(Event::InitApply(binding)) => {
                ingester.binding_added(&binding)
            }
            Ok(Event::Delete(binding)) => ingester.binding_deleted(&binding),
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(error) => warn!("binding watch error: {error}"),
        }
    }

    Ok(())
}
