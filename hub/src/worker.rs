//! SystemWorker — one tokio task per registered system (spec §4.5).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beszel_core::{Action, CombinedData, GetDataRequest, SystemId, SystemStatus};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alerts::AlertEngine;
use crate::db::RecordStore;
use crate::identity::SshIdentity;
use crate::ids::{SSH_STARTUP_DELAY, startup_jitter};
use crate::pipeline::RecordPipeline;
use crate::transport::codec;
use crate::transport::Transport;
use crate::transport::ssh::SshTransport;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(60_000);

pub struct WorkerHandle {
    pub cancel: CancellationToken,
    pub ws_tx: watch::Sender<Option<Transport>>,
    pub down_tx: mpsc::Sender<()>,
    pub join: JoinHandle<()>,
}

pub struct WorkerContext {
    pub store: Arc<dyn RecordStore>,
    pub pipeline: Arc<RecordPipeline>,
    pub ssh_identity: Arc<SshIdentity>,
    pub alerts: Arc<AlertEngine>,
    pub interval: Duration,
    /// Lets a worker ask the manager to remove it (spec §4.5 step 1: a
    /// paused system that fails its keepalive ping, or never had a WS
    /// transport at all, requests its own removal).
    pub remove_tx: mpsc::Sender<SystemId>,
}

/// Spawns the worker loop and returns the handle the manager uses to attach
/// WS transports, request removal, and forward down-connection signals.
pub fn spawn(system_id: SystemId, host: String, port: String, ctx: Arc<WorkerContext>) -> WorkerHandle {
    let cancel = CancellationToken::new();
    let (ws_tx, ws_rx) = watch::channel(None);
    let (down_tx, down_rx) = mpsc::channel(8);

    let worker_cancel = cancel.clone();
    let join = tokio::spawn(run(system_id, host, port, ctx, worker_cancel, ws_rx, down_rx));

    WorkerHandle { cancel, ws_tx, down_tx, join }
}

async fn run(
    system_id: SystemId,
    host: String,
    port: String,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
    mut ws_rx: watch::Receiver<Option<Transport>>,
    mut down_rx: mpsc::Receiver<()>,
) {
    let details_once = AtomicBool::new(true);
    let smart_once = AtomicBool::new(true);
    let last_status = Mutex::new(SystemStatus::Pending);

    let startup_delay = if ws_rx.borrow().is_some() {
        startup_jitter(ctx.interval)
    } else {
        SSH_STARTUP_DELAY
    };
    tokio::select! {
        _ = tokio::time::sleep(startup_delay) => {}
        _ = cancel.cancelled() => return,
    }

    let mut interval = tokio::time::interval(ctx.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(%system_id, "worker cancelled");
                return;
            }
            _ = down_rx.recv() => {
                let _ = ws_rx.changed().await;
                set_down(&ctx, &last_status, system_id, "ws connection dropped").await;
            }
            _ = interval.tick() => {
                tick(
                    system_id, &host, &port, &ctx, &ws_rx, &details_once, &smart_once, &last_status,
                ).await;
            }
        }
    }
}

async fn tick(
    system_id: SystemId,
    host: &str,
    port: &str,
    ctx: &Arc<WorkerContext>,
    ws_rx: &watch::Receiver<Option<Transport>>,
    details_once: &AtomicBool,
    smart_once: &AtomicBool,
    last_status: &Mutex<SystemStatus>,
) {
    let current_status = ctx.store.get_system(system_id).await.ok().flatten().map(|s| s.status());
    if current_status == Some(SystemStatus::Paused) {
        let ping_ok = match ws_rx.borrow().clone() {
            Some(transport) => transport.request(Action::GetData, &[]).await.is_ok(),
            None => false,
        };
        if !ping_ok {
            warn!(%system_id, "paused system has no reachable WS transport, requesting removal");
            let _ = ctx.remove_tx.send(system_id).await;
        }
        return;
    }

    let request = GetDataRequest {
        cache_time_ms: ctx.interval.as_millis() as u16,
        include_details: details_once.swap(false, Ordering::SeqCst),
    };
    let Ok(payload) = codec::encode(&request) else { return };

    let ws_transport = ws_rx.borrow().clone().filter(|t| t.is_connected());
    let result = match ws_transport {
        Some(transport) => transport.request(Action::GetData, &payload).await,
        None => ssh_request(host, port, ctx, &payload).await,
    };

    match result {
        Ok(raw) => match codec::decode::<CombinedData>(&raw) {
            Ok(data) => {
                if let Err(err) = ctx.pipeline.commit(system_id, &data).await {
                    warn!(%system_id, %err, "failed to commit tick");
                    set_down(ctx, last_status, system_id, "commit failure").await;
                    return;
                }
                if smart_once.swap(false, Ordering::SeqCst) && !data.smart.is_empty() {
                    let pipeline = Arc::clone(&ctx.pipeline);
                    let devices = data.smart.clone();
                    tokio::spawn(async move {
                        if let Err(err) = pipeline.commit_smart(system_id, &devices).await {
                            warn!(%system_id, %err, "failed to persist smart data");
                        }
                    });
                }
                set_up(ctx, last_status, system_id, &data).await;
            }
            Err(err) => {
                warn!(%system_id, %err, "failed to decode tick payload");
                set_down(ctx, last_status, system_id, "decode failure").await;
            }
        },
        Err(err) => {
            warn!(%system_id, %err, "tick request failed");
            set_down(ctx, last_status, system_id, "transport failure").await;
        }
    }
}

async fn ssh_request(
    host: &str,
    port: &str,
    ctx: &Arc<WorkerContext>,
    payload: &[u8],
) -> Result<Vec<u8>, crate::error::TransportError> {
    let ssh = SshTransport::dial(host, port, Arc::clone(&ctx.ssh_identity)).await?;
    ssh.request_with_retry(Action::GetData, payload, 1).await
}

async fn set_up(ctx: &Arc<WorkerContext>, last_status: &Mutex<SystemStatus>, system_id: SystemId, data: &CombinedData) {
    let mut guard = last_status.lock().await;
    let previous = *guard;
    *guard = SystemStatus::Up;
    drop(guard);
    if previous != SystemStatus::Up {
        ctx.alerts.on_status_change(system_id, previous, SystemStatus::Up).await;
    }
    ctx.alerts.evaluate_tick(system_id, &data.stats).await;
}

async fn set_down(ctx: &Arc<WorkerContext>, last_status: &Mutex<SystemStatus>, system_id: SystemId, reason: &str) {
    let mut guard = last_status.lock().await;
    let previous = *guard;
    if previous == SystemStatus::Down || previous == SystemStatus::Paused {
        return;
    }
    *guard = SystemStatus::Down;
    drop(guard);
    warn!(%system_id, reason, "marking system down");
    let _ = ctx.store.set_system_status(system_id, "down", None).await;
    ctx.alerts.on_status_change(system_id, previous, SystemStatus::Down).await;
}
