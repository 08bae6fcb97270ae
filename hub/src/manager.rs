//! SystemManager — process-wide registry of workers (spec §4.6).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use beszel_core::{System, SystemId, SystemStatus};
use chrono::Utc;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::AlertEngine;
use crate::auth::{self, FingerprintDecision};
use crate::config::Config;
use crate::db::RecordStore;
use crate::error::HubError;
use crate::identity::SshIdentity;
use crate::pipeline::RecordPipeline;
use crate::transport::Transport;
use crate::transport::ws::WsTransport;
use crate::worker::{self, WorkerContext, WorkerHandle};

pub struct SystemManager {
    workers: RwLock<HashMap<SystemId, WorkerHandle>>,
    store: Arc<dyn RecordStore>,
    ssh_identity: Arc<SshIdentity>,
    worker_ctx: Arc<WorkerContext>,
    data_dir: PathBuf,
}

impl SystemManager {
    pub fn new(store: Arc<dyn RecordStore>, config: &Config, alerts: Arc<AlertEngine>) -> anyhow::Result<Arc<Self>> {
        let ssh_identity = SshIdentity::load_or_generate(&config.data_dir)?;
        let (remove_tx, remove_rx) = mpsc::channel(16);
        let worker_ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            pipeline: Arc::new(RecordPipeline::new(Arc::clone(&store))),
            ssh_identity: Arc::clone(&ssh_identity),
            alerts,
            interval: worker::DEFAULT_INTERVAL,
            remove_tx,
        });
        let manager = Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            store,
            ssh_identity,
            worker_ctx,
            data_dir: config.data_dir.clone(),
        });
        manager.clone().spawn_removal_listener(remove_rx);
        Ok(manager)
    }

    /// Drains `WorkerContext::remove_tx` requests (paused systems with no
    /// reachable WS transport) and runs the same `Remove(id)` operation a
    /// direct manager call would.
    fn spawn_removal_listener(self: Arc<Self>, mut remove_rx: mpsc::Receiver<SystemId>) {
        tokio::spawn(async move {
            while let Some(id) = remove_rx.recv().await {
                self.remove(id).await;
            }
        });
    }

    pub fn ssh_identity(&self) -> &Arc<SshIdentity> {
        &self.ssh_identity
    }

    /// Reconciles `config.yml` against the store (if present, spec §6), then
    /// loads every non-paused system and starts its worker. Analogue of the
    /// teacher's `AssetsFile`/`SiteCfg` boot-time reconciliation, generalized
    /// from BESS assets to monitored systems.
    pub async fn reconcile_roster(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(entries) = crate::config::load_roster(&self.data_dir)? {
            self.apply_roster(entries).await?;
        }
        for system in self.store.list_systems().await? {
            if system.status() != SystemStatus::Paused {
                self.add(system).await;
            }
        }
        Ok(())
    }

    /// Updates systems matching a roster entry by `(name, host, port)`,
    /// creates unknown ones with a fresh token, and removes systems the
    /// roster no longer names; existing tokens are preserved unless the
    /// entry specifies one.
    async fn apply_roster(&self, entries: Vec<crate::config::RosterEntry>) -> anyhow::Result<()> {
        let existing = self.store.list_systems().await?;
        let mut matched = HashSet::new();

        for entry in &entries {
            if let Some(system) =
                existing.iter().find(|s| s.name == entry.name && s.host == entry.host && s.port == entry.port)
            {
                matched.insert(system.id);
                if let Some(token) = entry.token.as_deref().and_then(|t| Uuid::parse_str(t).ok()) {
                    self.store.set_token(system.id, token).await?;
                }
                continue;
            }

            let Some(owner) = self.store.any_user_id().await? else {
                warn!(name = %entry.name, "config.yml roster entry has no owning user yet, skipping");
                continue;
            };
            let now = Utc::now();
            let system = System {
                id: Uuid::new_v4(),
                user_id: owner,
                name: entry.name.clone(),
                host: entry.host.clone(),
                port: entry.port.clone(),
                status: "pending".into(),
                info: None,
                created_at: now,
                updated_at: now,
            };
            self.store.upsert_system(&system).await?;
            matched.insert(system.id);
            match entry.token.as_deref().and_then(|t| Uuid::parse_str(t).ok()) {
                Some(token) => self.store.set_token(system.id, token).await?,
                None => {
                    self.store.ensure_token(system.id).await?;
                }
            }
            info!(name = %entry.name, "created system from config.yml roster");
        }

        for system in &existing {
            if !matched.contains(&system.id) {
                info!(system_id = %system.id, name = %system.name, "removing system absent from config.yml roster");
                self.remove(system.id).await;
            }
        }
        Ok(())
    }

    pub async fn add(self: &Arc<Self>, system: System) {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&system.id) {
            return;
        }
        let handle = worker::spawn(system.id, system.host.clone(), system.port.clone(), Arc::clone(&self.worker_ctx));
        workers.insert(system.id, handle);
        info!(system_id = %system.id, name = %system.name, "worker started");
    }

    pub async fn remove(&self, id: SystemId) {
        if let Some(handle) = self.workers.write().await.remove(&id) {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
        let _ = self.store.delete_system(id).await;
    }

    /// Reacts to an operator edit: host/port change, pause/unpause, or removal.
    pub async fn on_system_record_change(self: &Arc<Self>, before: &System, after: &System) {
        if after.status() == SystemStatus::Paused {
            self.remove_worker_only(after.id).await;
            return;
        }
        let host_changed = before.host != after.host || before.port != after.port;
        let was_paused = before.status() == SystemStatus::Paused;
        if host_changed || was_paused {
            self.remove_worker_only(after.id).await;
            self.add(after.clone()).await;
        }
    }

    async fn remove_worker_only(&self, id: SystemId) {
        if let Some(handle) = self.workers.write().await.remove(&id) {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    /// Authenticates the agent over the freshly upgraded socket and attaches
    /// it to the matching worker, replacing any prior WS handle (spec §4.4, §4.6).
    pub async fn handle_ws_upgrade(self: &Arc<Self>, system_id: SystemId, socket: WebSocket) -> Result<(), HubError> {
        let has_worker = self.workers.read().await.contains_key(&system_id);
        if !has_worker {
            return Err(HubError::NotFound);
        }

        let (ws, down_rx) = WsTransport::spawn(socket);
        let transport = Transport::Ws(ws);

        let token = self.store.ensure_token(system_id).await.map_err(HubError::Persistence)?;
        let stored = self.store.get_fingerprint(system_id).await.map_err(HubError::Persistence)?;
        let need_sys_info = stored.as_ref().map(|f| f.fingerprint.is_empty()).unwrap_or(true);

        let outcome = auth::check_fingerprint(&transport, &self.ssh_identity, token, need_sys_info).await?;
        match auth::reconcile(stored.as_ref().map(|f| f.fingerprint.as_str()), &outcome.fingerprint) {
            FingerprintDecision::Reject => {
                warn!(%system_id, "fingerprint mismatch, refusing connection");
                transport.close().await;
                return Err(HubError::Unauthorized);
            }
            FingerprintDecision::Bind => {
                self.store.bind_fingerprint(system_id, &outcome.fingerprint).await.map_err(HubError::Persistence)?;
            }
            FingerprintDecision::Accept => {}
        }

        let workers = self.workers.read().await;
        let Some(handle) = workers.get(&system_id) else {
            transport.close().await;
            return Err(HubError::NotFound);
        };
        let _ = handle.ws_tx.send(Some(transport));

        let bridge_tx = handle.down_tx.clone();
        drop(workers);
        tokio::spawn(async move {
            let mut down_rx = down_rx;
            if down_rx.recv().await.is_some() {
                let _ = bridge_tx.send(()).await;
            }
        });

        Ok(())
    }
}
