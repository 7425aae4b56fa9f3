//! onemount daemon.
//!
//! Wires the engine together and mounts OneDrive as a FUSE
//! filesystem: local stores, Graph remote store, transfer managers,
//! delta engine, connectivity monitor, offline journal replay, an
//! optional webhook listener, and a Prometheus-backed event sink.
//!
//! Token acquisition is out of scope here: the daemon reads a bearer
//! token from a file maintained by an external helper and re-reads it
//! on every request, so rotation needs no restart.

mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use onemount_cache::{ContentStore, DatabasePool, MetadataStore};
use onemount_conflict::ConflictResolver;
use onemount_core::config::Config;
use onemount_core::domain::{ConflictPolicy, Entry, ItemId, ItemKind, ItemState};
use onemount_core::ports::{EventSink, RemoteError, RemoteStore, TokenSource};
use onemount_fs::OneMountFs;
use onemount_graph::{GraphStore, WebhookListener};
use onemount_sync::{
    ConnectivityMonitor, DeltaEngine, DownloadManager, OfflineJournal, StateManager, SyncManager,
    UploadManager,
};

use metrics::MetricsSink;

/// Mount OneDrive as an on-demand FUSE filesystem.
#[derive(Debug, Parser)]
#[command(name = "onemountd", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mount point, overriding the configuration.
    #[arg(long)]
    mount_point: Option<PathBuf>,

    /// File containing the current bearer token.
    #[arg(long, default_value = "/run/onemount/token")]
    token_file: PathBuf,
}

/// Token source reading the bearer token from a file on every request.
struct FileTokenSource {
    path: PathBuf,
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn bearer_token(&self) -> Result<String, RemoteError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map(|t| t.trim().to_string())
            .map_err(|e| {
                RemoteError::PermissionDenied(format!(
                    "cannot read token file {}: {}",
                    self.path.display(),
                    e
                ))
            })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path);
    if let Some(mount_point) = args.mount_point {
        config.fuse.mount_point = mount_point;
    }

    init_tracing(&config);
    let problems = config.validate();
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("config error: {}: {}", p.field, p.message);
        }
        bail!("invalid configuration ({} problems)", problems.len());
    }

    info!(config = %config_path.display(), "onemountd starting");

    // --- Stores ---
    let db_path = config.cache.dir.join("metadata.db");
    let pool = DatabasePool::new(&db_path).await?;
    let metadata = MetadataStore::new(pool);
    let content = Arc::new(ContentStore::new(
        &config.cache.dir,
        config.cache.content_max_size_gb * 1024 * 1024 * 1024,
    )?);

    // --- Remote ---
    let tokens: Arc<dyn TokenSource> = Arc::new(FileTokenSource {
        path: args.token_file,
    });
    let remote: Arc<dyn RemoteStore> = Arc::new(GraphStore::new(tokens));

    // --- Connectivity ---
    let monitor = Arc::new(ConnectivityMonitor::new(
        Arc::clone(&remote),
        Duration::from_secs(config.delta.probe_interval_secs),
    ));
    let online = monitor.online_flag();
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&monitor).run(shutdown.child_token()));

    // --- Engine ---
    let events: Arc<MetricsSink> = Arc::new(MetricsSink::new());
    let sink: Arc<dyn EventSink> = events.clone();
    let state = Arc::new(StateManager::new(
        metadata.clone(),
        Arc::clone(&sink),
        Arc::clone(&online),
    ));
    let downloads = DownloadManager::new(
        Arc::clone(&state),
        Arc::clone(&content),
        Arc::clone(&remote),
        Arc::clone(&sink),
    );
    downloads.spawn_workers(config.transfers.download_workers);
    let uploads = UploadManager::new(
        Arc::clone(&state),
        Arc::clone(&content),
        Arc::clone(&remote),
        Arc::clone(&sink),
        config.transfers.upload_queue_depth,
        config.transfers.low_priority_parallelism,
    );
    uploads.spawn_workers(config.transfers.upload_workers);
    let journal = Arc::new(OfflineJournal::new(metadata.clone(), Arc::clone(&online)));

    let policy = ConflictPolicy::parse(&config.conflicts.default_policy)
        .context("conflict policy already validated")?;
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(16);
    let delta = DeltaEngine::new(
        Arc::clone(&state),
        Arc::clone(&content),
        Arc::clone(&remote),
        Arc::clone(&uploads),
        Arc::clone(&downloads),
        ConflictResolver::new(policy),
        Arc::clone(&sink),
        Arc::clone(&online),
        Duration::from_secs(config.delta.poll_interval_secs),
    );
    tokio::spawn(Arc::clone(&delta).run(trigger_rx));

    let sync_manager = SyncManager::new(
        Arc::clone(&state),
        Arc::clone(&remote),
        Arc::clone(&uploads),
        Arc::clone(&delta),
        Arc::clone(&sink),
    );
    tokio::spawn(Arc::clone(&sync_manager).run(monitor.reconnected()));

    // --- Webhook (optional) ---
    let mut subscription_id: Option<String> = None;
    if config.webhook.enabled {
        let client_state = format!("onemount-{}", uuid::Uuid::new_v4());
        let listener = WebhookListener::bind(
            config.webhook.listen_addr.parse()?,
            client_state.clone(),
            bridge_trigger(trigger_tx.clone()),
        )
        .await?;
        tokio::spawn(listener.run());
        let notify_url = config
            .webhook
            .public_url
            .clone()
            .context("webhook.public_url validated")?;
        match remote
            .create_subscription(
                "/me/drive/root",
                &notify_url,
                &client_state,
                chrono::Utc::now() + chrono::Duration::hours(24),
            )
            .await
        {
            Ok(sub) => {
                info!(id = %sub.id, expires = %sub.expiration, "webhook subscription active");
                subscription_id = Some(sub.id);
            }
            Err(e) => warn!(error = %e, "webhook subscription failed; polling only"),
        }
    }

    // --- Root bootstrap ---
    let root_id = bootstrap_root(&metadata, remote.as_ref()).await?;

    // --- Eviction sweep ---
    spawn_evictor(
        metadata.clone(),
        Arc::clone(&content),
        Arc::clone(&state),
        shutdown.child_token(),
    );

    // --- Mount ---
    let fs = OneMountFs::new(
        tokio::runtime::Handle::current(),
        root_id,
        Arc::clone(&state),
        Arc::clone(&content),
        Arc::clone(&downloads),
        Arc::clone(&uploads),
        Arc::clone(&journal),
        Arc::clone(&remote),
        Duration::from_secs(config.fuse.attr_ttl_secs),
        Duration::from_secs(config.transfers.operation_deadline_secs),
    );
    let _ = fs.add_virtual_file(
        ".onemount",
        format!("onemount {}\n", env!("CARGO_PKG_VERSION")).into_bytes(),
    );

    std::fs::create_dir_all(&config.fuse.mount_point)?;
    let options = vec![
        fuser::MountOption::FSName(config.fuse.volume_name.clone()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::NoExec,
    ];
    let session = fuser::spawn_mount2(fs, &config.fuse.mount_point, &options)
        .with_context(|| format!("mounting {}", config.fuse.mount_point.display()))?;
    info!(mount = %config.fuse.mount_point.display(), "filesystem mounted");

    // --- Run until signalled ---
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    if let Some(id) = subscription_id {
        if let Err(e) = remote.delete_subscription(&id).await {
            warn!(error = %e, "subscription cleanup failed");
        }
    }
    delta.shutdown();
    sync_manager.shutdown();
    downloads.shutdown();
    uploads.shutdown();
    drop(session);
    info!(
        metric_families = events.registry().gather().len(),
        "unmounted"
    );
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Ensures the drive root is tracked and returns its id.
async fn bootstrap_root(
    metadata: &MetadataStore,
    remote: &dyn RemoteStore,
) -> anyhow::Result<ItemId> {
    // A previous run already knows the root: the only entry whose
    // parent is the sentinel.
    for entry in metadata.all_entries().await? {
        if entry.parent_id().is_sentinel() && entry.is_directory() {
            return Ok(entry.id().clone());
        }
    }

    // First run: fetch the root item ("root" is the well-known alias).
    let root = remote
        .get_item("root")
        .await
        .context("cannot reach the drive root; a first mount needs connectivity")?;
    // Stored as a ghost; opendir populates it like any other
    // unlisted directory.
    let entry = Entry::from_remote(
        ItemId::remote(root.id.clone()),
        ItemId::sentinel(),
        if root.name.is_empty() { "root".to_string() } else { root.name.clone() },
        ItemKind::Directory,
        0,
        root.mtime.unwrap_or_else(chrono::Utc::now),
        root.etag.clone(),
        None,
    );
    metadata.save(&entry).await?;
    info!(id = %entry.id(), "drive root bootstrapped");
    Ok(entry.id().clone())
}

/// Periodic LRU sweep keeping the content cache under its cap.
fn spawn_evictor(
    metadata: MetadataStore,
    content: Arc<ContentStore>,
    state: Arc<StateManager>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let entries = match metadata.all_entries().await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "eviction sweep cannot list entries");
                    continue;
                }
            };
            // Only fully synced files are evictable; dirty or
            // in-flight content is pinned.
            let evictable: std::collections::HashSet<ItemId> = entries
                .iter()
                .filter(|e| {
                    e.state() == ItemState::Hydrated && !e.has_changes() && !e.is_virtual()
                })
                .map(|e| e.id().clone())
                .collect();
            let evicted = match content.evict_lru(|id| evictable.contains(id)) {
                Ok(evicted) => evicted,
                Err(e) => {
                    warn!(error = %e, "eviction sweep failed");
                    continue;
                }
            };
            for id in evicted {
                if let Err(e) = state
                    .transition(
                        &id,
                        ItemState::Ghost,
                        onemount_core::domain::TransitionOptions::default(),
                    )
                    .await
                {
                    warn!(%id, error = %e, "evicted blob could not be ghosted");
                }
            }
        }
    });
}

/// Adapts webhook notifications into bare delta triggers.
fn bridge_trigger(
    delta_trigger: tokio::sync::mpsc::Sender<()>,
) -> tokio::sync::mpsc::Sender<onemount_graph::WebhookNotification> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<onemount_graph::WebhookNotification>(16);
    tokio::spawn(async move {
        while let Some(_notification) = rx.recv().await {
            let _ = delta_trigger.try_send(());
        }
    });
    tx
}
