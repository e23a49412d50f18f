//! # GraphLoom Server
//!
//! Starts the engine and serves the REST API.
//!
//! ```bash
//! graphloom-server --config config.toml --listen 127.0.0.1:8640
//! ```

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use graphloom::{Config, GraphEngine, HttpCompletion, PromptLibrary, System};

#[derive(Parser)]
#[command(name = "graphloom-server", version, about = "Incremental knowledge graph engine")]
struct Args {
    /// Configuration file (defaults to config.toml + config.local.toml + env)
    #[arg(long)]
    config: Option<String>,

    /// Listen address override
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path).context("loading configuration file")?,
        None => Config::load().context("loading configuration")?,
    };

    // Keep the guard alive for the lifetime of the process so the file
    // writer flushes on exit.
    let _file_guard = init_logging(&config)?;

    let api_key = std::env::var(&config.completion.api_key_env).ok();
    let completion = Arc::new(HttpCompletion::new(
        config.completion.base_url.clone(),
        config.completion.model.clone(),
        api_key,
    ));
    let prompts = PromptLibrary::load(&config.prompts.dir);

    let listen_addr = args
        .listen
        .unwrap_or_else(|| config.http.listen_addr.clone());
    let default_db = config.default_database_path();

    let engine = if default_db.exists() {
        info!(path = %default_db.display(), "loading default database");
        GraphEngine::load(config, completion, prompts, None, &default_db)?
    } else {
        info!("starting with an empty database");
        GraphEngine::new(config, completion, prompts, None, System::new())
    };
    let engine = Arc::new(engine);
    engine.start();

    let router = graphloom::rest::router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = %listen_addr, "graphloom server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    engine.stop().await;
    info!("shutdown complete");
    Ok(())
}

fn init_logging(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let stdout_layer = fmt::layer().with_target(true).with_filter(filter);

    if config.logging.verbose {
        // Verbose mode routes DEBUG (and up) to rolling files while stdout
        // keeps the configured level.
        let appender = tracing_appender::rolling::daily(&config.logging.dir, "graphloom.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug"));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
        Ok(None)
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
