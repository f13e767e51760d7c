// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `plugdesk serve`: wires the registry, routing engine, job scheduler,
//! watcher, and HTTP server together and runs until shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use plugdesk_config::model::AuthConfig;
use plugdesk_config::PlugdeskConfig;
use plugdesk_core::{PlugdeskError, PluginState};
use plugdesk_gateway::{
    builtin_handlers, start_server, AppState, DeclarativeRouteSource, FileRouteSource,
    PageRenderer, RoutingEngine, ServerConfig, SharedPolicy, ShellRenderer, StaticRoutes,
    TokenAccessPolicy,
};
use plugdesk_plugin::{
    apply_event, JobScheduler, ManagerHostApi, ManagerSettings, PluginManager, PluginWatcher,
    ProcessRuntime, RuntimeLoader, WasmRuntime, WasmSettings, WatchEvent,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::shutdown;

/// Run the server until SIGINT/SIGTERM.
pub async fn run_serve(config: PlugdeskConfig) -> Result<(), PlugdeskError> {
    init_tracing(&config.logging.level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting plugdesk");

    let shutdown = shutdown::install_signal_handler();

    let manager = build_manager(&config)?;
    if config.plugins.lazy {
        manager.discover()?;
    } else {
        let loaded = manager.discover_and_load_all().await?;
        info!(count = loaded.len(), "plugins loaded at startup");
    }

    let policy = token_policy(&config.auth);
    let renderer: Arc<dyn PageRenderer> = Arc::new(ShellRenderer::default());
    let declarative: Arc<dyn DeclarativeRouteSource> = match &config.routes.file {
        Some(file) => Arc::new(FileRouteSource::new(file)),
        None => Arc::new(StaticRoutes::empty()),
    };
    let routing = Arc::new(RoutingEngine::new(
        manager.clone(),
        declarative,
        builtin_handlers(manager.clone(), renderer.clone()),
        renderer.clone(),
        policy.clone(),
    ));
    routing.rebuild();
    let rebuild_listener = routing.spawn_rebuild_listener(&shutdown);

    let scheduler = Arc::new(JobScheduler::new(manager.clone(), &shutdown));
    scheduler.start();
    let resync_listener = scheduler.spawn_resync_listener();

    let watcher = if config.plugins.hot_reload {
        match spawn_watcher(&config, &manager, &routing, &shutdown) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "hot reload disabled, could not watch plugin directory");
                None
            }
        }
    } else {
        None
    };

    let state = AppState {
        manager: manager.clone(),
        routing,
        policy,
        renderer,
        upload_limit: config.server.upload_limit_mb * 1024 * 1024,
    };
    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
    };
    let result = start_server(&server_config, state, shutdown.clone()).await;

    // The server may also stop on its own, e.g. when binding fails.
    shutdown.cancel();
    scheduler.shutdown().await;
    let _ = rebuild_listener.await;
    let _ = resync_listener.await;
    if let Some((watcher, task)) = watcher {
        let _ = task.await;
        drop(watcher);
    }
    manager.shutdown_all().await;
    info!("plugdesk stopped");
    result
}

/// Build the registry with the sandbox limits from configuration.
pub(crate) fn build_manager(config: &PlugdeskConfig) -> Result<Arc<PluginManager>, PlugdeskError> {
    let call_timeout = Duration::from_secs(config.plugins.call_timeout_secs);
    let wasm = Arc::new(WasmRuntime::new(WasmSettings {
        fuel: config.plugins.wasm_fuel,
        max_memory_bytes: config.plugins.wasm_max_memory_mb * 1024 * 1024,
        timeout: call_timeout,
    })?);
    let loader = RuntimeLoader::new(wasm.clone(), ProcessRuntime::default());

    let mut settings = ManagerSettings::new(&config.plugins.dir);
    settings.default_enabled = config.plugins.default_enabled;
    settings.overrides = config.plugins.overrides.clone();
    settings.call_timeout = call_timeout;
    settings.log_capacity = config.plugins.log_capacity;

    let manager = Arc::new(PluginManager::new(Arc::new(loader), settings));
    wasm.set_host_api(Box::new(ManagerHostApi::new(&manager)));
    Ok(manager)
}

fn token_policy(auth: &AuthConfig) -> SharedPolicy {
    let policy = auth
        .tokens
        .iter()
        .fold(TokenAccessPolicy::new(), |policy, entry| {
            policy.with_token(&entry.token, &entry.user, entry.admin)
        });
    if policy.is_empty() {
        warn!("no [[auth.tokens]] configured, every /plugins request will be rejected");
    }
    Arc::new(policy)
}

/// Apply filesystem changes to the registry until shutdown.
fn spawn_watcher(
    config: &PlugdeskConfig,
    manager: &Arc<PluginManager>,
    routing: &Arc<RoutingEngine>,
    shutdown: &CancellationToken,
) -> Result<(PluginWatcher, JoinHandle<()>), PlugdeskError> {
    let debounce = Duration::from_millis(config.plugins.watch_debounce_ms);
    let routes_file = config.routes.file.as_deref().map(Path::new);
    let (watcher, mut events) = PluginWatcher::start(manager.plugin_dir(), routes_file, debounce)?;

    let eager = !config.plugins.lazy;
    let manager = Arc::clone(manager);
    let routing = Arc::clone(routing);
    let shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match &event {
                WatchEvent::RoutesChanged => {
                    info!("route file changed, rebuilding routes");
                    routing.rebuild();
                }
                WatchEvent::PluginChanged(name) | WatchEvent::PluginRemoved(name) => {
                    if let Err(e) = apply_event(&manager, &event).await {
                        warn!(plugin = %name, error = %e, "failed to apply plugin change");
                        continue;
                    }
                    if eager
                        && matches!(event, WatchEvent::PluginChanged(_))
                        && manager.state(name) == Some(PluginState::Discovered)
                        && let Err(e) = manager.get(name).await
                    {
                        warn!(plugin = %name, error = %e, "failed to load new plugin");
                    }
                }
            }
        }
    });
    Ok((watcher, task))
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("plugdesk={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}
