//! AlertEngine — status-transition and sliding-window alert evaluation plus
//! notification delivery fan-out (spec §4.9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use beszel_core::{AlertHistory, AlertRule, AlertRuleName, SystemId, SystemStats, SystemStatus, UserId};

use crate::db::RecordStore;
use crate::expiry_map::ExpiryMap;

const NOTIFICATION_SETTINGS_TTL: Duration = Duration::from_secs(5 * 60);
const WEBHOOK_SCHEME_TTL: Duration = Duration::from_secs(5 * 60);

/// Sliding accumulator for a CPU/Memory/Disk/... rule: running sum, sample
/// count, and when the window started.
#[derive(Clone, Copy, Default)]
struct SlidingWindow {
    sum: f64,
    count: u64,
    first_tick: Option<Instant>,
}

struct PendingCountdown {
    cancel: CancellationToken,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WebhookScheme {
    Mattermost,
    Slack,
    Discord,
    Ntfy,
    Lark,
    Bark,
    Generic,
}

impl WebhookScheme {
    fn parse(url: &str) -> Self {
        let lower = url.to_lowercase();
        if lower.contains("mattermost") {
            WebhookScheme::Mattermost
        } else if lower.contains("hooks.slack.com") {
            WebhookScheme::Slack
        } else if lower.contains("discord.com") || lower.contains("discordapp.com") {
            WebhookScheme::Discord
        } else if lower.contains("ntfy") {
            WebhookScheme::Ntfy
        } else if lower.contains("larksuite") || lower.contains("feishu") {
            WebhookScheme::Lark
        } else if lower.contains("bark") {
            WebhookScheme::Bark
        } else {
            WebhookScheme::Generic
        }
    }
}

/// Email delivery is out of scope beyond dispatch (spec §1 non-goal on email
/// provider libraries); the hub owns only this trait and a logging stub.
#[async_trait::async_trait]
pub trait EmailSink: Send + Sync {
    async fn send(&self, to: &[String], subject: &str, body: &str);
}

pub struct NullEmailSink;

#[async_trait::async_trait]
impl EmailSink for NullEmailSink {
    async fn send(&self, to: &[String], subject: &str, _body: &str) {
        warn!(recipients = ?to, subject, "email delivery not configured, dropping notification");
    }
}

pub struct AlertEngine {
    store: Arc<dyn RecordStore>,
    http: Client,
    email: Arc<dyn EmailSink>,
    pending_alerts: Mutex<HashMap<Uuid, PendingCountdown>>,
    sliding: Mutex<HashMap<(Uuid, Option<String>), SlidingWindow>>,
    notification_cache: Arc<ExpiryMap<UserId, beszel_core::UserNotificationSettings>>,
    scheme_cache: Arc<ExpiryMap<String, WebhookScheme>>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Arc<Self> {
        Self::with_email_sink(store, Arc::new(NullEmailSink))
    }

    pub fn with_email_sink(store: Arc<dyn RecordStore>, email: Arc<dyn EmailSink>) -> Arc<Self> {
        Arc::new(Self {
            store,
            http: Client::new(),
            email,
            pending_alerts: Mutex::new(HashMap::new()),
            sliding: Mutex::new(HashMap::new()),
            notification_cache: ExpiryMap::new(),
            scheme_cache: ExpiryMap::new(),
        })
    }

    /// Status-rule handling: arms/cancels the down-countdown on transition
    /// (spec §4.9 "Status rules").
    pub async fn on_status_change(self: &Arc<Self>, system_id: SystemId, from: SystemStatus, to: SystemStatus) {
        let Ok(rules) = self.store.list_alert_rules(system_id).await else { return };
        let status_rules: Vec<_> = rules.into_iter().filter(|r| is_status_rule(&r.name)).collect();
        if status_rules.is_empty() {
            return;
        }

        match (from, to) {
            (_, SystemStatus::Down) => {
                for rule in status_rules {
                    self.arm_down_countdown(rule, system_id).await;
                }
            }
            (SystemStatus::Down, SystemStatus::Up) => {
                for rule in status_rules {
                    self.cancel_countdown(rule.id).await;
                    if rule.triggered {
                        self.resolve(&rule, "recovered").await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn arm_down_countdown(self: &Arc<Self>, rule: AlertRule, system_id: SystemId) {
        let cancel = CancellationToken::new();
        self.pending_alerts.lock().await.insert(rule.id, PendingCountdown { cancel: cancel.clone() });

        let deadline = Duration::from_secs((rule.min_duration_minutes.max(0) as u64) * 60);
        let store = Arc::clone(&self.store);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if let Ok(Some(current)) = store.get_system(system_id).await.map(|s| s.map(|s| s.status())) {
                        if current == SystemStatus::Down {
                            engine.trigger_and_record(&rule, "down").await;
                        }
                    }
                }
            }
        });
    }

    async fn cancel_countdown(&self, rule_id: Uuid) {
        if let Some(pending) = self.pending_alerts.lock().await.remove(&rule_id) {
            pending.cancel.cancel();
        }
    }

    /// Sliding-value rules: CPU/Memory/Disk/Temperature/Bandwidth/LoadAvg
    /// (spec §4.9 "Sliding-value rules").
    pub async fn evaluate_tick(&self, system_id: SystemId, stats: &SystemStats) {
        let Ok(rules) = self.store.list_alert_rules(system_id).await else { return };
        for rule in rules {
            let Some(name) = parse_rule_name(&rule.name) else { continue };
            if name.is_status() {
                continue;
            }
            if name.is_map_valued() {
                for (key, value) in map_values(name, stats) {
                    if rule.descriptor.as_deref() == Some(key.as_str()) {
                        self.evaluate_sliding(&rule, value).await;
                    }
                }
            } else if let Some(value) = scalar_value(name, stats) {
                self.evaluate_sliding(&rule, value).await;
            }
        }
    }

    async fn evaluate_sliding(&self, rule: &AlertRule, value: f64) {
        let key = (rule.id, rule.descriptor.clone());
        let min_duration = Duration::from_secs((rule.min_duration_minutes.max(0) as u64) * 60);

        let mut guard = self.sliding.lock().await;
        let window = guard.entry(key.clone()).or_default();
        window.sum += value;
        window.count += 1;
        let first_tick = *window.first_tick.get_or_insert_with(Instant::now);

        if first_tick.elapsed() < min_duration {
            return;
        }

        let avg = window.sum / window.count as f64;
        *window = SlidingWindow::default();
        drop(guard);

        if !rule.triggered && avg > rule.threshold {
            self.trigger_and_record(rule, "breach").await;
        } else if rule.triggered && avg <= rule.threshold {
            self.resolve(rule, "recovered").await;
        }
    }

    async fn trigger_and_record(&self, rule: &AlertRule, kind: &str) {
        if let Err(err) = self.store.set_alert_rule_triggered(rule.id, true).await {
            error!(%err, "failed to persist alert trigger, leaving rule untriggered");
            return;
        }
        let entry = AlertHistory {
            id: Uuid::new_v4(),
            alert_rule_id: rule.id,
            system_id: rule.system_id,
            user_id: rule.user_id,
            name: rule.name.clone(),
            triggered_at: Utc::now(),
            resolved_at: None,
        };
        let _ = self.store.insert_alert_history(&entry).await;
        self.deliver(rule, kind).await;
    }

    async fn resolve(&self, rule: &AlertRule, kind: &str) {
        if let Err(err) = self.store.set_alert_rule_triggered(rule.id, false).await {
            error!(%err, "failed to persist alert resolution, leaving rule triggered");
            return;
        }
        let _ = self.store.resolve_open_alert_history(rule.id, Utc::now()).await;
        self.deliver(rule, kind).await;
    }

    async fn deliver(&self, rule: &AlertRule, kind: &str) {
        let settings = match self.notification_cache.get(&rule.user_id).await {
            Some(settings) => settings,
            None => match self.store.user_notification_settings(rule.user_id).await {
                Ok(settings) => {
                    self.notification_cache.set(rule.user_id, settings.clone(), NOTIFICATION_SETTINGS_TTL).await;
                    settings
                }
                Err(err) => {
                    error!(%err, "failed to load notification settings");
                    return;
                }
            },
        };

        let title = format!("{} {}", rule.name, kind);
        let body = alert_body(rule, kind);
        let link = format!("/system/{}", rule.system_id);

        if !settings.emails.is_empty() {
            self.email.send(&settings.emails, &title, &body).await;
        }

        for url in &settings.webhooks {
            let scheme = match self.scheme_cache.get(url).await {
                Some(s) => s,
                None => {
                    let s = WebhookScheme::parse(url);
                    self.scheme_cache.set(url.clone(), s, WEBHOOK_SCHEME_TTL).await;
                    s
                }
            };
            if let Err(err) = self.post_webhook(url, scheme, &title, &body, &link).await {
                warn!(%err, url, "webhook delivery failed, not retrying");
            }
        }
    }

    /// Per-scheme formatting table (spec §4.9, §9 "webhook scheme quirks"):
    /// `mattermost` uses a markdown level-5 heading; `slack`/`discord`
    /// prepend title to body; `ntfy` carries title as a query param and the
    /// link as an `Actions` header; `lark`/`bark` pass `link`/`url` JSON
    /// params; `generic` templates a `$<titleKey>` placeholder into the
    /// body when the URL names one. Everything but `ntfy`/`lark`/`bark`
    /// appends the link to the body.
    async fn post_webhook(
        &self,
        url: &str,
        scheme: WebhookScheme,
        title: &str,
        body: &str,
        link: &str,
    ) -> anyhow::Result<()> {
        match scheme {
            WebhookScheme::Mattermost => {
                let payload = serde_json::json!({ "text": format!("##### {title}\n{body}\n{link}") });
                self.http.post(url).json(&payload).send().await?.error_for_status()?;
            }
            WebhookScheme::Slack | WebhookScheme::Discord => {
                let payload = serde_json::json!({ "text": format!("{title}\n{body}\n{link}") });
                self.http.post(url).json(&payload).send().await?.error_for_status()?;
            }
            WebhookScheme::Ntfy => {
                self.http
                    .post(url)
                    .query(&[("title", title)])
                    .header("Actions", format!("view, Open, {link}"))
                    .body(body.to_string())
                    .send()
                    .await?
                    .error_for_status()?;
            }
            WebhookScheme::Lark | WebhookScheme::Bark => {
                let payload =
                    serde_json::json!({ "title": title, "content": body, "link": link, "url": link });
                self.http.post(url).json(&payload).send().await?.error_for_status()?;
            }
            WebhookScheme::Generic => {
                let body_with_link = format!("{body}\n{link}");
                let rendered = match query_param(url, "titleKey") {
                    Some(key) => body_with_link.replace(&format!("${key}"), title),
                    None => body_with_link,
                };
                let payload = serde_json::json!({ "title": title, "body": rendered });
                self.http.post(url).json(&payload).send().await?.error_for_status()?;
            }
        }
        Ok(())
    }
}

fn query_param(url: &str, key: &str) -> Option<String> {
    reqwest::Url::parse(url).ok()?.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

fn is_status_rule(name: &str) -> bool {
    parse_rule_name(name).map(|n| n.is_status()).unwrap_or(false)
}

fn parse_rule_name(raw: &str) -> Option<AlertRuleName> {
    match raw {
        "Status" => Some(AlertRuleName::Status),
        "CPU" => Some(AlertRuleName::Cpu),
        "Memory" => Some(AlertRuleName::Memory),
        "Disk" => Some(AlertRuleName::Disk),
        "Temperature" => Some(AlertRuleName::Temperature),
        "Bandwidth" => Some(AlertRuleName::Bandwidth),
        "LoadAvg" => Some(AlertRuleName::LoadAvg),
        _ => None,
    }
}

fn scalar_value(name: AlertRuleName, stats: &SystemStats) -> Option<f64> {
    match name {
        AlertRuleName::Cpu => Some(stats.cpu),
        AlertRuleName::Memory => Some(stats.mem_pct),
        AlertRuleName::LoadAvg => stats.load_avg_1,
        AlertRuleName::Bandwidth => Some(stats.net_sent_bytes + stats.net_recv_bytes),
        _ => None,
    }
}

fn map_values(name: AlertRuleName, stats: &SystemStats) -> Vec<(String, f64)> {
    match name {
        AlertRuleName::Temperature => stats.temperatures.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        AlertRuleName::Disk => stats.disks.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        _ => Vec::new(),
    }
}

fn alert_body(rule: &AlertRule, kind: &str) -> String {
    match &rule.descriptor {
        Some(descriptor) if !descriptor.is_empty() => {
            format!("{} ({descriptor}) {kind} on system {}", rule.name, rule.system_id)
        }
        _ => format!("{} {kind} on system {}", rule.name, rule.system_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;

    fn rule(id: Uuid, system_id: Uuid, user_id: Uuid, name: &str, threshold: f64, min_duration_minutes: i64) -> AlertRule {
        AlertRule {
            id,
            system_id,
            user_id,
            name: name.into(),
            descriptor: None,
            threshold,
            min_duration_minutes,
            enabled: true,
            triggered: false,
        }
    }

    #[tokio::test]
    async fn sliding_rule_triggers_after_window_elapses() {
        let store = Arc::new(InMemoryStore::new());
        let system_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let rule_id = Uuid::new_v4();
        store.seed_alert_rule(rule(rule_id, system_id, user_id, "CPU", 50.0, 0));
        let engine = AlertEngine::new(store.clone());

        let stats = SystemStats { cpu: 90.0, ..Default::default() };
        engine.evaluate_tick(system_id, &stats).await;

        let rules = store.list_alert_rules(system_id).await.unwrap();
        assert!(rules[0].triggered);
    }

    #[tokio::test]
    async fn sliding_rule_stays_silent_below_threshold() {
        let store = Arc::new(InMemoryStore::new());
        let system_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let rule_id = Uuid::new_v4();
        store.seed_alert_rule(rule(rule_id, system_id, user_id, "CPU", 90.0, 0));
        let engine = AlertEngine::new(store.clone());

        let stats = SystemStats { cpu: 10.0, ..Default::default() };
        engine.evaluate_tick(system_id, &stats).await;

        let rules = store.list_alert_rules(system_id).await.unwrap();
        assert!(!rules[0].triggered);
    }

    #[test]
    fn webhook_scheme_parses_known_hosts() {
        assert!(matches!(WebhookScheme::parse("https://mattermost.example.com/hooks/x"), WebhookScheme::Mattermost));
        assert!(matches!(WebhookScheme::parse("https://hooks.slack.com/services/x"), WebhookScheme::Slack));
        assert!(matches!(WebhookScheme::parse("https://example.com/generic"), WebhookScheme::Generic));
    }

    #[test]
    fn query_param_reads_named_param_and_misses_others() {
        let url = "https://example.com/hook?titleKey=subject&x=1";
        assert_eq!(query_param(url, "titleKey").as_deref(), Some("subject"));
        assert_eq!(query_param(url, "missing"), None);
    }
}
