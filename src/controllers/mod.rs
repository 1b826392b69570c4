use std::sync::Arc;
use std::time::Duration;

use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    admission,
    config::Settings,
    context::Context,
    metrics::{self, Metrics, State},
};

pub mod deployment;
pub mod proxy;

/// Fixed lease identifier shared by all operator replicas.
pub const LEASE_NAME: &str = "jaeger-nginx-proxy-controller-leader-election";

const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Wire up and run every component: the metrics endpoint, the admission
/// webhook, the deployment informer, and the (optionally leader-elected)
/// proxy reconciler. Returns once the root cancellation has propagated.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let client = settings.client().await?;

    let state = State::default();
    let metrics = Metrics::new(state.registry())?;
    let ctx = state.create_context(client.clone(), metrics.clone());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let watcher =
        deployment::DeploymentWatcher::new(deployment::NamespaceScope::parse(&settings.informer_namespaces));

    // The informer feeds external readers only; it runs regardless of
    // leadership.
    let informer_task = {
        let watcher = watcher.clone();
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.run(client, shutdown).await {
                error!("deployment informer failed: {err}");
            }
        })
    };

    let metrics_task = {
        let state = state.clone();
        let watcher = watcher.clone();
        let shutdown = shutdown.clone();
        let port = settings.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(state, watcher, port, shutdown).await {
                error!("metrics server failed: {err}");
            }
        })
    };

    let webhook_task = {
        let settings = settings.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = admission::run(&settings, shutdown).await {
                error!("admission webhook failed: {err}");
            }
        })
    };

    if settings.leader_election {
        run_with_leader_election(&settings, ctx, &metrics, shutdown.clone()).await?;
    } else {
        metrics.leader.set(1);
        proxy::run(ctx, settings.target_namespace.as_deref(), shutdown.clone()).await?;
    }

    shutdown.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = informer_task.await;
        let _ = metrics_task.await;
        let _ = webhook_task.await;
    })
    .await;

    Ok(())
}

/// Lease-based leadership: only the holder runs the reconciler, standbys
/// keep renewing. Losing the lease (or failing to talk to the apiserver)
/// stops the reconciler so two instances never write concurrently.
async fn run_with_leader_election(
    settings: &Settings,
    ctx: Arc<Context>,
    metrics: &Metrics,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("jaeger-nginx-proxy-operator-{}", std::process::id()));

    let leadership = LeaseLock::new(
        ctx.client.clone(),
        &settings.leader_election_namespace,
        LeaseLockParams {
            holder_id: holder_id.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    );

    info!(
        "leader election enabled, running as {holder_id} against lease {}/{LEASE_NAME}",
        settings.leader_election_namespace
    );

    let mut reconciler: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(LEASE_RENEW);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = reconciler.take() {
                    task.abort();
                    let _ = task.await;
                }
                metrics.leader.set(0);
                if let Err(err) = leadership.step_down().await {
                    warn!("failed to release leader lease: {err}");
                }
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        match leadership.try_acquire_or_renew().await {
            Ok(lease) if matches!(lease, LeaseLockResult::Acquired(_)) => {
                metrics.leader.set(1);
                if reconciler.is_none() {
                    info!("acquired leadership, starting reconciler");
                    let ctx = ctx.clone();
                    let target = settings.target_namespace.clone();
                    let shutdown = shutdown.clone();
                    reconciler = Some(tokio::spawn(async move {
                        if let Err(err) = proxy::run(ctx, target.as_deref(), shutdown).await {
                            error!("proxy controller failed: {err}");
                        }
                    }));
                }
            }
            Ok(_) => {
                metrics.leader.set(0);
                if let Some(task) = reconciler.take() {
                    warn!("lost leadership, stopping reconciler");
                    task.abort();
                }
            }
            Err(err) => {
                // Without a confirmed lease, assume it is not safe to lead.
                metrics.leader.set(0);
                warn!("leader election renew/acquire failed: {err}");
                if let Some(task) = reconciler.take() {
                    task.abort();
                    warn!("stopped reconciler due to leader election error");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            return std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
