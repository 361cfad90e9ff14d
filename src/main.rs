use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edge_reconciler::center::{HttpCenterClient, NodeIdentity};
use edge_reconciler::config::AgentConfig;
use edge_reconciler::container::ShellRuntime;
use edge_reconciler::control::HttpTaskControl;
use edge_reconciler::dispatcher::{Dispatcher, DispatcherDeps};
use edge_reconciler::http::{RequestClient, RetryPolicy};
use edge_reconciler::node::resolve_serial_number;
use edge_reconciler::store::{KvStore, LibSqlStore, LocalCache};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing();

    let mut config = AgentConfig::from_env().context("invalid configuration")?;

    let store: Arc<dyn KvStore> = match LibSqlStore::new_local(&config.cache_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(path = %config.cache_path.display(), error = %e, "Local cache unavailable, using in-memory cache");
            Arc::new(LibSqlStore::new_memory().await?)
        }
    };
    let cache = LocalCache::new(store);

    if config.center.host.is_none() {
        config.center.host = cache.center_host().await;
        if let Some(host) = &config.center.host {
            info!(center = %host, "Using cached center host");
        }
    }

    let serial_number = resolve_serial_number(
        &config.serial_number,
        config.serial_number_cmd.as_deref(),
        config.container.command_timeout,
    )
    .await;
    let identity = NodeIdentity {
        serial_number,
        model: config.model.clone(),
        name: config.name.clone(),
    };

    let client = RequestClient::new(config.request.timeout)?;
    let policy = RetryPolicy::from_count(config.request.retries, config.request.retry_delay);
    let center = HttpCenterClient::new(
        client.clone(),
        config.center.clone(),
        identity.clone(),
        policy,
    );
    let control = HttpTaskControl::new(client, &config.container.control_path_prefix, policy);
    let runtime = ShellRuntime::new(
        &config.container.binary,
        config.container.command_timeout,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        serial_number = %identity.serial_number,
        center = config.center.host.as_deref().unwrap_or("<unset>"),
        runtime = %config.container.binary,
        "Edge reconciler starting"
    );

    let dispatcher = Dispatcher::new(
        config,
        DispatcherDeps {
            center: Arc::new(center),
            control: Arc::new(control),
            runtime: Arc::new(runtime),
            cache,
        },
    )?;
    dispatcher.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    dispatcher.shutdown().await;
    Ok(())
}

/// Log to stderr, or to a daily rolling file under `AGENT_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("AGENT_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "edge-reconciler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
