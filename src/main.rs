use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use vigil::api;
use vigil::callback::{ListenerRegistry, WebhookListener, webhook};
use vigil::config::{Config, Mode};
use vigil::driver::{BrowserDriver, ScriptedDriver, Supervisor, browser, supervisor};
use vigil::executor::{Executor, RemoteExecutor, Runner};
use vigil::manager::Manager;
use vigil::store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.listen_address,
        "starting vigil"
    );

    match config.mode {
        Mode::Server => run_server(config).await,
        Mode::Executor => run_executor(config).await,
    }
}

/// Full control plane: manager + scheduler + control API + callbacks.
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let (listeners, webhook_listener) = callback_stack(&config)?;

    let runner: Arc<dyn Runner> = match &config.executor_url {
        Some(url) => {
            info!(executor = %url, "delegating runs to remote executor");
            Arc::new(RemoteExecutor::new(
                url,
                config.default_timeout,
                config.retry_grace,
            ))
        }
        None => Arc::new(build_executor(&config, listeners).await?),
    };

    let store = store::open(&config.store_uri).await?;
    let manager = Arc::new(Manager::new(store, runner).await?);

    if config.emitters.stdout {
        manager.add_emitter(Arc::new(vigil::emitter::StdoutEmitter::new(
            vigil::emitter::stdout::Config {
                pretty: config.emitters.stdout_pretty,
            },
        )));
    }

    let app = api::router(manager.clone(), &webhook_listener);
    let listener = TcpListener::bind(&config.listen_address).await?;
    info!(address = %config.listen_address, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    manager.close().await?;
    Ok(())
}

/// Standalone executor service for the out-of-process topology.
async fn run_executor(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let (listeners, webhook_listener) = callback_stack(&config)?;
    let executor = Arc::new(build_executor(&config, listeners).await?);

    let app = api::executor_router(executor).merge(webhook_listener.routes());
    let listener = TcpListener::bind(&config.listen_address).await?;
    info!(address = %config.listen_address, "executor service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn callback_stack(
    config: &Config,
) -> Result<(Arc<ListenerRegistry>, Arc<WebhookListener>), Box<dyn std::error::Error>> {
    let listeners = Arc::new(ListenerRegistry::new());
    let webhook_listener = Arc::new(WebhookListener::new(webhook::Config {
        advertise_url: config.webhook.advertise_url.clone(),
        path_prefix: config.webhook.path_prefix.clone(),
    }));
    listeners.register("webhook", webhook_listener.clone())?;
    Ok((listeners, webhook_listener))
}

async fn build_executor(
    config: &Config,
    listeners: Arc<ListenerRegistry>,
) -> Result<Executor, Box<dyn std::error::Error>> {
    let mut executor = Executor::new(listeners, config.default_timeout);
    executor.register_driver(Arc::new(ScriptedDriver::new()));

    let worker = match &config.browser.binary_path {
        Some(binary_path) => {
            let debug_address = debug_address(&config.browser.server_url);
            Some(
                Supervisor::start(supervisor::Config {
                    binary_path: binary_path.clone(),
                    binary_args: config.browser.binary_args.clone(),
                    debug_address,
                    recycle_interval: config.browser.recycle_interval,
                })
                .await?,
            )
        }
        None => None,
    };

    executor.register_driver(Arc::new(BrowserDriver::new(
        browser::Config {
            server_url: config.browser.server_url.clone(),
            dns_discovery: config.browser.dns_discovery,
        },
        worker,
    )));

    Ok(executor)
}

/// `host:port` of the browser debugging endpoint, for readiness probes.
fn debug_address(server_url: &str) -> String {
    let trimmed = server_url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let host_port = trimmed.split('/').next().unwrap_or(trimmed);
    if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{host_port}:9222")
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
