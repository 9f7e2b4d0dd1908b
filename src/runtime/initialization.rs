//! # Initialization
//!
//! Controller start-up: rustls provider, tracing, metrics, probe server,
//! Kubernetes client and the reconciler with its queue.

use crate::config::{ControllerConfig, LogFormat, SharedControllerConfig};
use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::Reconciler;
use crate::observability;
use crate::registry::KindRegistry;
use crate::runtime::watch::ResourceIndex;
use crate::server::{start_server, ServerState};
use crate::store::{KubeStore, ObjectKey, ResourceStore};
use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long the probe server may take to bind
const SERVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything the binary needs to run the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    pub config: SharedControllerConfig,
    pub reconciler: Arc<Reconciler>,
    pub queue: WorkQueue<ObjectKey>,
    /// Routes secret and pod events to resource keys
    pub index: Arc<ResourceIndex>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("config", &self.config)
            .field("server_listening", &self.server_state.listening())
            .finish_non_exhaustive()
    }
}

/// Install the tracing subscriber
///
/// `RUST_LOG` wins over `LOG_LEVEL` when set.
pub fn init_tracing(config: &ControllerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "pod_refresher_controller={}",
            config.log_level.to_ascii_lowercase()
        )
        .into()
    });

    let result = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    if let Err(e) = result {
        eprintln!("Tracing subscriber already initialized: {e}");
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler and queue setup
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before any TLS connection is made
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    let config: SharedControllerConfig = Arc::new(ControllerConfig::from_env());
    init_tracing(&config);

    info!("Starting Pod Refresher Controller");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let server_port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {e}");
        }
    });
    wait_for_server_ready(&server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let registry = Arc::new(KindRegistry::with_defaults());
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let reconciler = Arc::new(
        Reconciler::new(store, registry, Arc::clone(&config))
            .context("Failed to create reconciler")?,
    );
    let queue = WorkQueue::new(config.backoff_start_duration(), config.backoff_max_duration());

    if config.max_unavailable_fraction <= 0.0 || config.max_unavailable_fraction > 1.0 {
        warn!(
            "MAX_UNAVAILABLE_FRACTION={} is outside (0, 1]; resources without their own fraction will fail validation",
            config.max_unavailable_fraction
        );
    }

    info!("Controller initialized, starting watches...");

    Ok(InitializationResult {
        client,
        config,
        reconciler,
        queue,
        index: Arc::new(ResourceIndex::new()),
        server_state,
    })
}

/// Wait for the HTTP server to bind its listener
async fn wait_for_server_ready(
    server_state: &ServerState,
    server_handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.listening() {
            info!("HTTP server is accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > SERVER_STARTUP_TIMEOUT {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                SERVER_STARTUP_TIMEOUT.as_secs()
            ));
        }

        tokio::time::sleep(SERVER_POLL_INTERVAL).await;
    }
}
