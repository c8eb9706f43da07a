use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use stepbridge::BridgeConfig;
use stepruntime::{HandlerRegistry, HttpTrigger, RuntimeConfig, StepRuntime};
use stepserver::{configure, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|f| f.eq_ignore_ascii_case("json")).unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting step server");

    let config = RuntimeConfig::from_env();
    let mut handlers = HandlerRegistry::new();
    stepbridge::register_all(&mut handlers, BridgeConfig::from_runtime(&config));

    let runtime = Arc::new(StepRuntime::new(config, handlers));
    let report = runtime.load().await?;
    for skipped in &report.skipped {
        warn!(unit = %skipped.unit(), "Skipped: {}", skipped);
    }
    info!(
        loaded = report.loaded,
        skipped = report.skipped.len(),
        "Runtime initialized"
    );

    if let Err(e) = runtime.start_scheduler().await {
        error!("Some schedules did not start: {}", e);
    }

    let app_state = web::Data::new(AppState::new(HttpTrigger::new(runtime.clone())));

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    runtime.shutdown().await;
    Ok(())
}
