use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data,
};
use futures::TryFutureExt;
use serde_json::json;
pub use simple_database_provisioner::{self as provisioner, Settings, State, store, telemetry};
use std::sync::Arc;
use tracing::*;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/list")]
async fn list(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let instances = match c.store().find_all_instances() {
        Ok(instances) => instances,
        Err(error) => return HttpResponse::InternalServerError().json(error.to_string()),
    };
    let bindings = match c.store().find_all_bindings() {
        Ok(bindings) => bindings,
        Err(error) => return HttpResponse::InternalServerError().json(error.to_string()),
    };

    HttpResponse::Ok().json(json!({
        "instances": instances.iter().map(|i| i.display()).collect::<Vec<_>>(),
        "bindings": bindings.iter().map(|b| b.display()).collect::<Vec<_>>(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new()?;

    telemetry::init(&settings.log_level).await;

    info!(
        "Starting simple-database-provisioner version={0}",
        env!("CARGO_PKG_VERSION")
    );

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let store = Arc::new(store::FileStore::new(&settings.database_file));
    let html_path = settings.html_path.clone();
    let listen_addr = settings.listen_addr.clone();

    // Initiatilize Kubernetes controller state
    let state = State::new(settings, store);
    let controller = provisioner::run(state.clone());

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(list)
            .service(health)
            .service(metrics)
            .service(actix_files::Files::new("/", &html_path).index_file("index.html"))
    })
    .bind(&listen_addr)?
    .shutdown_timeout(5)
    .run();

    // Both runtimes implements graceful shutdown, so poll until both are done
    let result = tokio::try_join!(controller, server.map_err(provisioner::Error::StdIoError));

    match result {
        Ok(_) => {
            info!("Shutdown completed.");
            Ok(())
        }
        Err(error) => {
            error!("Failure: {}", error);
            std::process::exit(1)
        }
    }
}
