//! Factor store - normalised runtime signals consumed by decision rules.
//!
//! Factors are addressed by dot paths (`system.memory`, `integrations.gmail`)
//! and always hold a value in `[0, 1]`.

use async_trait::async_trait;
use chrono::{Datelike, Local, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

// ============================================================================
// Health Provider
// ============================================================================

/// Coarse health classification reported by the monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_factor(self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Critical => 0.0,
        }
    }
}

/// Resource usage in percent (0-100).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// Snapshot reported by a [`HealthProvider`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub resources: ResourceUsage,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Integration name -> connected.
    #[serde(default)]
    pub integrations: HashMap<String, bool>,
}

/// Source of system health, implemented by the resource monitors.
#[async_trait]
pub trait HealthProvider: Send + Sync {
    async fn system_health(&self) -> anyhow::Result<SystemHealth>;
}

// ============================================================================
// Factor Store
// ============================================================================

/// Integrations seeded as disconnected until a provider reports them.
const SEEDED_INTEGRATIONS: &[&str] = &["gmail", "whatsapp", "calendar"];

/// Point-in-time copy of every factor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FactorSnapshot(BTreeMap<String, f64>);

impl FactorSnapshot {
    /// Value at `path`, or 0 when unknown.
    pub fn get(&self, path: &str) -> f64 {
        self.0.get(path).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for FactorSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), normalize(v)))
                .collect(),
        )
    }
}

/// Shared, path-addressable factor values.
pub struct FactorStore {
    values: RwLock<BTreeMap<String, f64>>,
}

impl FactorStore {
    /// Create a store seeded with neutral values and no connected integrations.
    pub fn new() -> Self {
        let mut values = BTreeMap::new();
        values.insert("system.health".to_string(), 1.0);
        for resource in ["cpu", "memory", "disk"] {
            values.insert(format!("system.{resource}"), 0.5);
        }
        values.insert("system.errors".to_string(), 0.0);
        for integration in SEEDED_INTEGRATIONS {
            values.insert(format!("integrations.{integration}"), 0.0);
        }
        values.insert("user.activity".to_string(), 0.5);
        apply_environment(&mut values, Local::now());

        Self {
            values: RwLock::new(values),
        }
    }

    /// Current value at `path`; 0 for unknown paths.
    pub async fn get(&self, path: &str) -> f64 {
        self.values.read().await.get(path).copied().unwrap_or(0.0)
    }

    /// Overwrite a factor. Values are clamped into `[0, 1]`; NaN becomes 0.
    pub async fn set(&self, path: impl Into<String>, value: f64) {
        self.values.write().await.insert(path.into(), normalize(value));
    }

    pub async fn snapshot(&self) -> FactorSnapshot {
        FactorSnapshot(self.values.read().await.clone())
    }

    /// Pull fresh values from `provider`.
    ///
    /// Environment factors are always recomputed. A failing or missing
    /// provider leaves the system factors at their previous values.
    pub async fn refresh(&self, provider: Option<&dyn HealthProvider>) {
        let health = match provider {
            Some(provider) => match provider.system_health().await {
                Ok(health) => Some(health),
                Err(e) => {
                    tracing::warn!(error = %e, "Health provider failed, keeping stale factors");
                    None
                }
            },
            None => None,
        };

        let mut values = self.values.write().await;
        if let Some(health) = health {
            apply_health(&mut values, &health);
        }
        apply_environment(&mut values, Local::now());
        tracing::debug!(factors = values.len(), "Factors refreshed");
    }
}

impl Default for FactorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn apply_health(values: &mut BTreeMap<String, f64>, health: &SystemHealth) {
    let mut put = |path: String, value: f64| {
        values.insert(path, normalize(value));
    };

    put("system.health".into(), health.status.as_factor());
    put("system.cpu".into(), health.resources.cpu / 100.0);
    put("system.memory".into(), health.resources.memory / 100.0);
    put("system.disk".into(), health.resources.disk / 100.0);
    put("system.errors".into(), (health.errors.len() as f64 / 10.0).min(1.0));
    for (name, connected) in &health.integrations {
        put(format!("integrations.{name}"), if *connected { 1.0 } else { 0.0 });
    }
}

fn apply_environment<T: Datelike + Timelike>(values: &mut BTreeMap<String, f64>, now: T) {
    let hour = now.hour();
    let weekend = matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
    let business = !weekend && (9..17).contains(&hour);

    values.insert(
        "environment.time_of_day".into(),
        (hour as f64 + now.minute() as f64 / 60.0) / 24.0,
    );
    values.insert("environment.business_hours".into(), if business { 1.0 } else { 0.0 });
    values.insert("environment.weekend".into(), if weekend { 1.0 } else { 0.0 });
}
