//! Rollup & retention — hourly cron job generalizing the teacher's
//! `SiteAggregateBuilder` accumulation pattern from BESS asset aggregation to
//! rollup-tier stats aggregation (spec §4.8).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use beszel_core::{ROLLUP_STEPS, SystemId, SystemStats, Tier, round2};
use chrono::{Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::db::RecordStore;

const SYSTEMD_RETENTION: Duration = Duration::minutes(20);
const ALERT_HISTORY_K_SOFT: i64 = 200;
const ALERT_HISTORY_K_HARD: i64 = 250;

pub async fn spawn_scheduler(store: Arc<dyn RecordStore>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async_tz("0 8 * * * *", chrono::Utc, move |_id, _sched| {
        let store = Arc::clone(&store);
        Box::pin(async move {
            if let Err(err) = run_once(&store).await {
                warn!(%err, "rollup job failed");
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

pub async fn run_once(store: &Arc<dyn RecordStore>) -> Result<()> {
    info!("starting hourly rollup pass");
    let now = Utc::now();

    for system in store.list_systems().await? {
        if system.status() != beszel_core::SystemStatus::Up {
            continue;
        }
        roll_system_stats(store, system.id, now).await?;
    }

    for step in ROLLUP_STEPS {
        let cutoff = now - step.shorter.retention();
        let dropped = store.delete_system_stats_older_than(step.shorter.as_str(), cutoff).await?;
        if dropped > 0 {
            info!(tier = step.shorter.as_str(), dropped, "pruned expired system stats");
        }
        store.delete_container_stats_older_than(step.shorter.as_str(), cutoff).await?;
    }
    let longest = ROLLUP_STEPS.last().unwrap().longer;
    store.delete_system_stats_older_than(longest.as_str(), now - longest.retention()).await?;
    store.delete_container_stats_older_than(longest.as_str(), now - longest.retention()).await?;

    store.delete_systemd_older_than(now - SYSTEMD_RETENTION).await?;

    let mut seen_users = std::collections::HashSet::new();
    for system in store.list_systems().await? {
        if !seen_users.insert(system.user_id) {
            continue;
        }
        if store.count_alert_history(system.user_id).await? > ALERT_HISTORY_K_HARD {
            store.trim_alert_history(system.user_id, ALERT_HISTORY_K_SOFT).await?;
        }
    }

    Ok(())
}

async fn roll_system_stats(store: &Arc<dyn RecordStore>, system_id: SystemId, now: chrono::DateTime<Utc>) -> Result<()> {
    for step in ROLLUP_STEPS {
        let window_start = now - Duration::minutes(step.window_minutes);

        let already_rolled = step.shorter != Tier::OneMin
            && store.longer_tier_exists_within(system_id, step.longer.as_str(), now - Duration::minutes(step.window_minutes + 1)).await?;
        if already_rolled {
            continue;
        }

        let samples = store.list_system_stats_in_window(system_id, step.shorter.as_str(), window_start).await?;
        if samples.len() < step.min_shorter {
            continue;
        }

        let parsed: Vec<SystemStats> = samples
            .iter()
            .filter_map(|r| serde_json::from_value(r.stats.clone()).ok())
            .collect();
        if parsed.is_empty() {
            continue;
        }

        let aggregate = aggregate_stats(&parsed);
        let json = serde_json::to_value(aggregate)?;
        store.insert_system_stats_record(system_id, step.longer.as_str(), &json).await?;
    }
    Ok(())
}

/// Field-wise mean of the sample set, preserving peaks across tiers by
/// taking the max of each sample's point value *and* its own recorded peak.
/// Map-valued sub-structures union keys and average per key with its own
/// count — "missing in a sample" is "not present", never "zero".
fn aggregate_stats(samples: &[SystemStats]) -> SystemStats {
    let n = samples.len() as f64;

    let mut temps: HashMap<String, (f64, u32)> = HashMap::new();
    let mut disks: HashMap<String, (f64, u32)> = HashMap::new();
    let mut max_cpu = f64::MIN;
    let mut max_mem = f64::MIN;
    let mut max_disk = f64::MIN;
    let mut load_sum = 0.0;
    let mut load_count = 0u32;

    for sample in samples {
        max_cpu = max_cpu.max(sample.max_cpu.unwrap_or(sample.cpu)).max(sample.cpu);
        max_mem = max_mem.max(sample.max_mem_pct.unwrap_or(sample.mem_pct)).max(sample.mem_pct);
        max_disk = max_disk.max(sample.max_disk_pct.unwrap_or(sample.disk_pct)).max(sample.disk_pct);
        if let Some(load) = sample.load_avg_1 {
            load_sum += load;
            load_count += 1;
        }
        for (key, value) in &sample.temperatures {
            let entry = temps.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        for (key, value) in &sample.disks {
            let entry = disks.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    SystemStats {
        cpu: round2(samples.iter().map(|s| s.cpu).sum::<f64>() / n),
        max_cpu: Some(round2(max_cpu)),
        mem_pct: round2(samples.iter().map(|s| s.mem_pct).sum::<f64>() / n),
        max_mem_pct: Some(round2(max_mem)),
        disk_pct: round2(samples.iter().map(|s| s.disk_pct).sum::<f64>() / n),
        max_disk_pct: Some(round2(max_disk)),
        net_sent_bytes: round2(samples.iter().map(|s| s.net_sent_bytes).sum::<f64>() / n),
        net_recv_bytes: round2(samples.iter().map(|s| s.net_recv_bytes).sum::<f64>() / n),
        load_avg_1: if load_count > 0 { Some(round2(load_sum / load_count as f64)) } else { None },
        temperatures: temps.into_iter().map(|(k, (sum, count))| (k, round2(sum / count as f64))).collect(),
        disks: disks.into_iter().map(|(k, (sum, count))| (k, round2(sum / count as f64))).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;

    fn stats(cpu: f64, temp: Option<(&str, f64)>) -> SystemStats {
        let mut s = SystemStats { cpu, mem_pct: cpu, disk_pct: cpu, ..Default::default() };
        if let Some((k, v)) = temp {
            s.temperatures.insert(k.to_string(), v);
        }
        s
    }

    #[test]
    fn aggregate_averages_present_fields_and_tracks_peaks() {
        let samples = vec![stats(10.0, Some(("cpu0", 40.0))), stats(30.0, None), stats(20.0, Some(("cpu0", 60.0)))];
        let agg = aggregate_stats(&samples);
        assert_eq!(agg.cpu, 20.0);
        assert_eq!(agg.max_cpu, Some(30.0));
        // cpu0 present in 2 of 3 samples: averaged over its own count, not n.
        assert_eq!(agg.temperatures.get("cpu0"), Some(&50.0));
    }

    #[tokio::test]
    async fn rollup_skips_when_too_few_samples() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
        let system_id = uuid::Uuid::new_v4();
        store
            .insert_system_stats_record(system_id, "1m", &serde_json::to_value(stats(10.0, None)).unwrap())
            .await
            .unwrap();
        roll_system_stats(&store, system_id, Utc::now()).await.unwrap();
        let rolled = store.list_system_stats_in_window(system_id, "10m", Utc::now() - Duration::hours(1)).await.unwrap();
        assert!(rolled.is_empty());
    }
}
