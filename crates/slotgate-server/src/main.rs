use std::sync::Arc;

use anyhow::Context;
use slotgate::transport::{ServerConfig, serve};
use slotgate::webhook::CallbackSender;
use slotgate::{
    AdmissionConfig, AdmissionController, ConfigError, EvaluationService, HttpEvaluator,
    RedisStore, SLOTGATE_VERSION, StoreConfig, TaskLauncher,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SLOTGATE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "slotgate={level},slotgate_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let admission = AdmissionConfig::from_env()?;
    let store_config = StoreConfig::from_env();
    let server_config = ServerConfig::from_env()?;
    let evaluator_url =
        std::env::var("EVALUATOR_URL").map_err(|_| ConfigError::Missing("EVALUATOR_URL"))?;

    tracing::info!(
        version = SLOTGATE_VERSION,
        max_concurrent = admission.max_concurrent,
        key_prefix = %store_config.key_prefix,
        "Starting slotgate"
    );

    let store = RedisStore::connect(&store_config)
        .await
        .with_context(|| format!("connecting to {}", store_config.redis_url))?;

    let controller = Arc::new(AdmissionController::new(Arc::new(store), admission));
    controller.start();

    let evaluator = HttpEvaluator::new(evaluator_url).context("building evaluator client")?;
    let callbacks = CallbackSender::new().context("building callback client")?;
    let launcher = TaskLauncher::new(controller.clone(), Arc::new(evaluator), callbacks);

    let service = Arc::new(EvaluationService::new(controller, launcher));
    serve(server_config, service).await
}
