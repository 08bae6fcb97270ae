//! RecordPipeline — commits one agent tick's `CombinedData` durably (spec §4.7).
//!
//! Children (stats, container, systemd rows) are written before the parent
//! `systems` row's `status`/`info`/`updated_at` update, so a reader never
//! observes `status = up` without the data that justifies it. `PgStore`
//! can't expose a raw `sqlx::Transaction` through the `RecordStore` trait
//! object boundary, so atomicity here is "children first, parent last" at
//! the call-site level rather than a single SQL transaction — acceptable
//! because a crash between steps only ever leaves stale-but-safe rows, never
//! a `status=up` pointing at missing children.

use std::sync::Arc;

use anyhow::Result;
use beszel_core::{CombinedData, SystemId, fnv32, round2};

use crate::db::RecordStore;

pub struct RecordPipeline {
    store: Arc<dyn RecordStore>,
}

impl RecordPipeline {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn commit(&self, system_id: SystemId, data: &CombinedData) -> Result<()> {
        if let Some(details) = &data.details {
            self.store.upsert_system_details(system_id, details).await?;
        }

        let stats_json = serde_json::to_value(rounded_stats(&data.stats))?;
        self.store.insert_system_stats_record(system_id, "1m", &stats_json).await?;

        for container in &data.containers {
            if container.container_id.is_empty() {
                continue;
            }
            let key = self
                .store
                .upsert_container(system_id, &container.container_id, &container.name)
                .await?;
            let container_json = serde_json::to_value(container)?;
            self.store.insert_container_stats_record(system_id, key, "1m", &container_json).await?;
        }

        for service in &data.systemd {
            let key = fnv32(format!("{system_id}||{}", service.name).as_bytes());
            let info = serde_json::to_value(service)?;
            self.store.upsert_systemd_service(system_id, key, &info).await?;
        }

        let info = serde_json::to_value(&data.info)?;
        self.store.set_system_status(system_id, "up", Some(info)).await?;

        Ok(())
    }

    /// SMART data is persisted out of the hot path, fired once per session
    /// after the first successful commit (spec §4.7 "smart_once").
    pub async fn commit_smart(&self, system_id: SystemId, devices: &[beszel_core::SmartDeviceInfo]) -> Result<()> {
        for device in devices {
            let info = serde_json::to_value(device)?;
            self.store.upsert_smart_device(system_id, &device.device_key, &info).await?;
        }
        Ok(())
    }
}

fn rounded_stats(stats: &beszel_core::SystemStats) -> beszel_core::SystemStats {
    let mut out = stats.clone();
    out.cpu = round2(out.cpu);
    out.mem_pct = round2(out.mem_pct);
    out.disk_pct = round2(out.disk_pct);
    out.net_sent_bytes = round2(out.net_sent_bytes);
    out.net_recv_bytes = round2(out.net_recv_bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use beszel_core::{AgentInfo, ContainerStats, SystemDetails, SystemStats};

    fn combined() -> CombinedData {
        CombinedData {
            stats: SystemStats { cpu: 12.345, mem_pct: 50.0, ..Default::default() },
            info: AgentInfo { v: "0.12.3".into() },
            containers: vec![ContainerStats { container_id: "abc".into(), name: "nginx".into(), ..Default::default() }],
            systemd: vec![],
            details: Some(SystemDetails { hostname: Some("box".into()), ..Default::default() }),
            smart: vec![],
        }
    }

    #[tokio::test]
    async fn commit_writes_children_then_marks_system_up() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_system(beszel_core::System {
            id: uuid::Uuid::nil(),
            user_id: uuid::Uuid::nil(),
            name: "box".into(),
            host: "h".into(),
            port: "45876".into(),
            status: "pending".into(),
            info: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        });
        let pipeline = RecordPipeline::new(store.clone());
        let id = uuid::Uuid::nil();
        pipeline.commit(id, &combined()).await.unwrap();

        let system = store.get_system(id).await.unwrap().unwrap();
        assert_eq!(system.status, "up");
        let stats = store.list_system_stats_in_window(id, "1m", chrono::Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(stats.len(), 1);
    }
}
