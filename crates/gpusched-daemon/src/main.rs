//! gpusched daemon
//!
//! Watches for pending pods addressed to this scheduler and runs each one
//! through the filter/score/reserve/bind cycle, with the lease reaper
//! collecting orphaned reservations in the background.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gpusched_core::names::{ANNOTATION_CLAIM, SCHEDULER_NAME};
use gpusched_core::SchedulerConfig;
use gpusched_lease::{LeaseArbiter, LeaseReaper};
use gpusched_scheduler::{Framework, GpuPlugin, NodeStateCache, ScheduleOutcome};
use gpusched_store::kubernetes::{
    pod_record, KubeClaimStore, KubeEventSink, KubeLeaseStore, KubeNodeStatusStore, KubePodStore,
};
use gpusched_store::PodPhase;

/// gpuschedd - topology-aware GPU scheduler for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "gpuschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the plugin configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scheduler name pods must request in spec.schedulerName
    #[arg(long, default_value = SCHEDULER_NAME)]
    scheduler_name: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    info!("Starting gpuschedd v{}", env!("CARGO_PKG_VERSION"));

    // A broken config file is fatal; no config file means defaults
    let config = match &args.config {
        Some(path) => SchedulerConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("fatal config error: {}", e))?,
        None => SchedulerConfig::default(),
    };

    let client = Client::try_default().await?;

    // Wire the stores, arbiter, cache, plugin, and cycle driver
    let leases = Arc::new(KubeLeaseStore::new(client.clone()));
    let pods = Arc::new(KubePodStore::new(client.clone()));
    let claims = Arc::new(KubeClaimStore::new(client.clone()));
    let statuses = Arc::new(KubeNodeStatusStore::new(client.clone()));
    let events = Arc::new(KubeEventSink::new(client.clone(), args.scheduler_name.clone()));

    let arbiter = Arc::new(LeaseArbiter::new(
        leases.clone(),
        config.cycle.rollback_deadline(),
    ));
    let cache = NodeStateCache::new(statuses, arbiter.clone(), config.shares.default_slots);
    let reserve_retries = config.cycle.reserve_retries;
    let reaper = LeaseReaper::new(leases, pods.clone(), config.reaper.period());
    let plugin = Arc::new(GpuPlugin::new(
        claims,
        pods.clone(),
        events.clone(),
        cache,
        arbiter,
        config,
    ));
    let framework = Framework::new(plugin, pods, events, reserve_retries);

    let cancel = CancellationToken::new();
    let reaper_task = tokio::spawn(reaper.run(cancel.child_token()));

    // Feed pending pods addressed to us through the scheduling cycle
    let pod_api: Api<Pod> = Api::all(client);
    let pod_stream = watcher(pod_api, watcher::Config::default())
        .default_backoff()
        .applied_objects();
    futures::pin_mut!(pod_stream);

    info!(scheduler = %args.scheduler_name, "Watching for pods");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            event = pod_stream.next() => {
                match event {
                    Some(Ok(pod)) => {
                        let Some(record) = pod_record(pod) else {
                            continue;
                        };
                        if record.scheduler_name.as_deref() != Some(args.scheduler_name.as_str())
                            || record.node.is_some()
                            || record.phase != PodPhase::Pending
                            || !record.annotations.contains_key(ANNOTATION_CLAIM)
                        {
                            continue;
                        }
                        match framework.schedule_one(&record).await {
                            Ok(ScheduleOutcome::Scheduled { node }) => {
                                info!(pod = %record.name, node = %node, "Scheduled");
                            }
                            Ok(ScheduleOutcome::Unschedulable { .. }) => {
                                warn!(pod = %record.name, "Unschedulable this cycle");
                            }
                            Ok(ScheduleOutcome::Skipped) => {}
                            Err(e) => {
                                error!(pod = %record.name, error = %e, "Scheduling cycle failed");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Pod watch error");
                    }
                    None => {
                        warn!("Pod watch stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = reaper_task.await;
    info!("Shutdown complete");
    Ok(())
}
