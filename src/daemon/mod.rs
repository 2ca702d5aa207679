use crate::config::Config;
use crate::gateway::Gateway;
use crate::kv::KvStore;
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const SUPERVISOR_INITIAL_BACKOFF_SECS: u64 = 1;
const SUPERVISOR_MAX_BACKOFF_SECS: u64 = 60;
const DEDUP_SWEEP_SECS: u64 = 600;

pub async fn run(config: Config, dry_run: bool) -> Result<()> {
    crate::health::mark_ok("daemon");

    let store = crate::kv::create_kv_store(&config.dedup)?;
    let processor = crate::processor::create_processor(&config.processor);
    let factory = crate::transport::create_factory(&config.transport, dry_run);
    let gateway = Gateway::build(&config, factory, store.clone(), processor);
    let journal = spawn_event_journal(config.events_file_path());

    start_configured_instances(&gateway, &config).await;
    crate::status_events::emit(
        "daemon.state",
        serde_json::json!({ "state": "started", "instances": config.instances.len() }),
    );

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(
        gateway.clone(),
        config.state_file_path(),
        Duration::from_secs(config.gateway.state_flush_secs.max(1)),
    )];

    {
        let store = store.clone();
        handles.push(spawn_component_supervisor(
            "dedup-sweeper",
            SUPERVISOR_INITIAL_BACKOFF_SECS,
            SUPERVISOR_MAX_BACKOFF_SECS,
            move || {
                let store = store.clone();
                async move { run_dedup_sweeper(store, Duration::from_secs(DEDUP_SWEEP_SECS)).await }
            },
        ));
    }

    println!("📨 relaygate daemon started");
    println!("   Instances:  {}", config.instances.len());
    println!("   Dedup:      {}", store.name());
    println!("   State file: {}", config.state_file_path().display());
    println!("   Events:     {}", config.events_file_path().display());
    if dry_run {
        println!("   Transport:  loopback (dry run)");
    }
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    crate::health::mark_error("daemon", "shutdown requested");
    tracing::info!("Shutdown requested; tearing down instances");
    crate::status_events::emit("daemon.state", serde_json::json!({ "state": "stopping" }));

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    gateway.shutdown().await;
    if let Err(e) = write_state(&gateway, &config.state_file_path()).await {
        tracing::warn!("Final state write failed: {e}");
    }
    journal.abort();

    Ok(())
}

/// Start every configured account. One bad account never stops the daemon.
async fn start_configured_instances(gateway: &Gateway, config: &Config) {
    for instance in &config.instances {
        match gateway
            .start_instance(&instance.identity, instance.session_path.clone())
            .await
        {
            Ok(started) => {
                tracing::info!(
                    "Instance {} started (debug port {})",
                    started.identity(),
                    started.debug_port()
                );
            }
            Err(e) => {
                crate::health::mark_error(
                    &format!("instance:{}", instance.identity),
                    e.to_string(),
                );
                tracing::error!("Failed to start instance {}: {e}", instance.identity);
            }
        }
    }
}

/// Read the state file last written by a running daemon.
pub fn read_state(config: &Config) -> Result<serde_json::Value> {
    let path = config.state_file_path();
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("No daemon state at {}", path.display()))?;
    serde_json::from_str(&raw).context("Daemon state file is not valid JSON")
}

async fn write_state(gateway: &Gateway, path: &Path) -> Result<()> {
    let mut json = gateway.snapshot_json();
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "written_at".into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    let data = serde_json::to_vec_pretty(&json)?;
    tokio::fs::write(path, data).await?;
    Ok(())
}

fn spawn_state_writer(gateway: Arc<Gateway>, path: PathBuf, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = write_state(&gateway, &path).await {
                tracing::debug!("State write failed: {e}");
            }
        }
    })
}

/// Append every lifecycle event to a JSON-lines journal. Subscribes before
/// returning so nothing emitted afterwards is missed.
fn spawn_event_journal(path: PathBuf) -> JoinHandle<()> {
    let (subscriber, mut events) = crate::status_events::subscribe();
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Event journal {} unavailable: {e}", path.display());
                crate::status_events::unsubscribe(subscriber);
                return;
            }
        };

        while let Some(mut line) = events.recv().await {
            tracing::debug!(target: "relaygate::events", "{line}");
            line.push('\n');
            let written = match file.write_all(line.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!("Event journal write failed: {e}");
            }
        }
    })
}

async fn run_dedup_sweeper(store: Arc<dyn KvStore>, every: Duration) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let removed = store.purge_expired().await?;
        if removed > 0 {
            tracing::debug!("Dedup sweep removed {removed} expired records");
        }
        crate::health::mark_ok("dedup-sweeper");
    }
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                }
                Err(e) => {
                    crate::health::mark_error(name, e.to_string());
                    tracing::error!("Daemon component '{name}' failed: {e}");
                }
            }

            crate::health::bump_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
