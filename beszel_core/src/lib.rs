//! Domain types and wire-protocol structures shared between the hub and
//! anything that needs to speak its agent-connection protocol. Kept free of
//! transport, persistence, and scheduling concerns so it can be depended on
//! without pulling in tokio/sqlx/axum.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SystemId = Uuid;
pub type UserId = Uuid;
pub type AlertRuleId = Uuid;

/// Lifecycle state of a monitored `System`, as seen by the worker/manager pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Pending,
    Up,
    Down,
    Paused,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Pending => "pending",
            SystemStatus::Up => "up",
            SystemStatus::Down => "down",
            SystemStatus::Paused => "paused",
        }
    }
}

/// Identity of a monitored host. See spec §3 "System".
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct System {
    pub id: SystemId,
    pub user_id: UserId,
    pub name: String,
    pub host: String,
    pub port: String,
    pub status: String,
    pub info: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl System {
    pub fn status(&self) -> SystemStatus {
        match self.status.as_str() {
            "up" => SystemStatus::Up,
            "down" => SystemStatus::Down,
            "paused" => SystemStatus::Paused,
            _ => SystemStatus::Pending,
        }
    }
}

/// Binds a `System` to exactly one agent installation. See spec §3 "Fingerprint".
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fingerprint {
    pub system_id: SystemId,
    pub token: Uuid,
    pub fingerprint: String,
}

/// Rollup tier — a bucket size for time-series stats records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    OneMin,
    TenMin,
    TwentyMin,
    OneTwentyMin,
    FourEightyMin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::OneMin => "1m",
            Tier::TenMin => "10m",
            Tier::TwentyMin => "20m",
            Tier::OneTwentyMin => "120m",
            Tier::FourEightyMin => "480m",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Tier::OneMin),
            "10m" => Some(Tier::TenMin),
            "20m" => Some(Tier::TwentyMin),
            "120m" => Some(Tier::OneTwentyMin),
            "480m" => Some(Tier::FourEightyMin),
            _ => None,
        }
    }

    /// Retention window per spec §4.8 retention table.
    pub fn retention(&self) -> chrono::Duration {
        match self {
            Tier::OneMin => chrono::Duration::hours(1),
            Tier::TenMin => chrono::Duration::hours(12),
            Tier::TwentyMin => chrono::Duration::hours(24),
            Tier::OneTwentyMin => chrono::Duration::days(7),
            Tier::FourEightyMin => chrono::Duration::days(30),
        }
    }
}

/// One row of the rollup tier table (spec §4.8).
#[derive(Debug, Clone, Copy)]
pub struct RollupStep {
    pub shorter: Tier,
    pub longer: Tier,
    pub window_minutes: i64,
    pub min_shorter: usize,
}

pub const ROLLUP_STEPS: [RollupStep; 4] = [
    RollupStep { shorter: Tier::OneMin, longer: Tier::TenMin, window_minutes: 10, min_shorter: 9 },
    RollupStep { shorter: Tier::TenMin, longer: Tier::TwentyMin, window_minutes: 20, min_shorter: 2 },
    RollupStep {
        shorter: Tier::TwentyMin,
        longer: Tier::OneTwentyMin,
        window_minutes: 120,
        min_shorter: 6,
    },
    RollupStep {
        shorter: Tier::OneTwentyMin,
        longer: Tier::FourEightyMin,
        window_minutes: 480,
        min_shorter: 4,
    },
];

/// System-level stats sampled (or rolled up) for one tick/bucket.
///
/// `max_*` fields carry the peak observed across the sample set backing this
/// row; at the finest (`1m`) tier they equal the point value itself. Map
/// fields (`temperatures`, `disks`) are unioned across samples during rollup,
/// with "missing in a sample" treated as "not present", never "zero".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu: f64,
    pub max_cpu: Option<f64>,
    pub mem_pct: f64,
    pub max_mem_pct: Option<f64>,
    pub disk_pct: f64,
    pub max_disk_pct: Option<f64>,
    pub net_sent_bytes: f64,
    pub net_recv_bytes: f64,
    pub load_avg_1: Option<f64>,
    pub temperatures: HashMap<String, f64>,
    pub disks: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SystemStatsRecord {
    pub id: Uuid,
    pub system_id: SystemId,
    pub tier: String,
    pub stats: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub name: String,
    pub cpu_pct: f64,
    pub max_cpu_pct: Option<f64>,
    pub mem_bytes: f64,
    pub max_mem_bytes: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContainerStatsRecord {
    pub id: Uuid,
    pub system_id: SystemId,
    pub container_key: i64,
    pub tier: String,
    pub stats: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemdServiceInfo {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SystemdServiceRecord {
    pub id: Uuid,
    pub system_id: SystemId,
    pub service_key: i64,
    pub info: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartDeviceInfo {
    pub device_key: String,
    pub model: Option<String>,
    pub health: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SmartDeviceRecord {
    pub id: Uuid,
    pub system_id: SystemId,
    pub device_key: String,
    pub info: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Static per-system info, written only on the first tick of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemDetails {
    pub hostname: Option<String>,
    pub kernel: Option<String>,
    pub cpu_model: Option<String>,
    pub cores: Option<u32>,
    pub os: Option<String>,
}

/// Operator-declared alert kind. See spec §3 "AlertRule".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AlertRuleName {
    Status,
    Cpu,
    Memory,
    Disk,
    Temperature,
    Bandwidth,
    LoadAvg,
}

impl AlertRuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertRuleName::Status => "Status",
            AlertRuleName::Cpu => "CPU",
            AlertRuleName::Memory => "Memory",
            AlertRuleName::Disk => "Disk",
            AlertRuleName::Temperature => "Temperature",
            AlertRuleName::Bandwidth => "Bandwidth",
            AlertRuleName::LoadAvg => "LoadAvg",
        }
    }

    pub fn is_map_valued(&self) -> bool {
        matches!(self, AlertRuleName::Temperature | AlertRuleName::Disk)
    }

    pub fn is_status(&self) -> bool {
        matches!(self, AlertRuleName::Status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertRule {
    pub id: AlertRuleId,
    pub system_id: SystemId,
    pub user_id: UserId,
    pub name: String,
    /// Map key for map-valued rules (per-sensor temperature, per-FS disk); empty otherwise.
    pub descriptor: Option<String>,
    pub threshold: f64,
    pub min_duration_minutes: i64,
    pub enabled: bool,
    pub triggered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertHistory {
    pub id: Uuid,
    pub alert_rule_id: AlertRuleId,
    pub system_id: SystemId,
    pub user_id: UserId,
    pub name: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserNotificationSettings {
    pub user_id: UserId,
    pub emails: Vec<String>,
    pub webhooks: Vec<String>,
}

// ---------------------------------------------------------------------
// Wire protocol (hub <-> agent), CBOR. See spec §6.
// ---------------------------------------------------------------------

/// Closed action enum. Ordering must remain stable: it is the wire discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    GetData = 0,
    CheckFingerprint = 1,
    GetContainerLogs = 2,
    GetContainerInfo = 3,
    GetSmartData = 4,
    GetSystemdInfo = 5,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown wire action discriminant {0}")]
pub struct UnknownAction(pub u8);

impl TryFrom<u8> for Action {
    type Error = UnknownAction;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Action::GetData),
            1 => Ok(Action::CheckFingerprint),
            2 => Ok(Action::GetContainerLogs),
            3 => Ok(Action::GetContainerInfo),
            4 => Ok(Action::GetSmartData),
            5 => Ok(Action::GetSystemdInfo),
            other => Err(UnknownAction(other)),
        }
    }
}

/// Request envelope. `data` is the CBOR-encoded, action-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: Option<u32>,
    pub action: u8,
    pub data: Vec<u8>,
}

/// Response envelope for agents at or above `MinVersionAgentResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Option<u32>,
    pub error: Option<String>,
    pub data: Vec<u8>,
}

/// Agent response-envelope support floor. Agents reporting an older semver
/// in their SSH banner speak the legacy raw-payload dialect instead.
pub const MIN_VERSION_AGENT_RESPONSE: (u64, u64, u64) = (0, 12, 0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckFingerprintRequest {
    pub signature: Vec<u8>,
    pub need_sys_info: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckFingerprintResponse {
    pub fingerprint: String,
    pub hostname: Option<String>,
    pub sys_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataRequest {
    pub cache_time_ms: u16,
    pub include_details: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent semver, e.g. `"0.12.3"`.
    pub v: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinedData {
    pub stats: SystemStats,
    pub info: AgentInfo,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
    #[serde(default)]
    pub systemd: Vec<SystemdServiceInfo>,
    #[serde(default)]
    pub details: Option<SystemDetails>,
    #[serde(default)]
    pub smart: Vec<SmartDeviceInfo>,
}

/// Stable FNV-1a 32-bit hash, used to derive container/systemd row keys from
/// `system_id || entity_key` (spec §4.7).
pub fn fnv32(input: &[u8]) -> i64 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for byte in input {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

/// Round to two decimal places, matching the rollup job's persisted precision.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv32_is_stable() {
        let a = fnv32(b"system-1||container-7");
        let b = fnv32(b"system-1||container-7");
        assert_eq!(a, b);
        assert_ne!(a, fnv32(b"system-1||container-8"));
    }

    #[test]
    fn round2_matches_spec_examples() {
        assert_eq!(round2(55.0), 55.0);
        assert_eq!(round2(92.49999), 92.5);
    }

    #[test]
    fn action_roundtrips_through_u8() {
        for (n, expected) in [
            (0u8, Action::GetData),
            (1, Action::CheckFingerprint),
            (2, Action::GetContainerLogs),
            (3, Action::GetContainerInfo),
            (4, Action::GetSmartData),
            (5, Action::GetSystemdInfo),
        ] {
            assert_eq!(Action::try_from(n).unwrap(), expected);
        }
        assert!(Action::try_from(6).is_err());
    }
}
