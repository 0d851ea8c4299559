//! TOML config file loading, validation, environment overrides and selection
//! of the monitored greenhouse.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::thresholds::{default_thresholds, Thresholds};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub web: WebConfig,
    /// Greenhouse to monitor; the first greenhouse of the first farm when
    /// unset.
    pub greenhouse: Option<String>,
    pub devices: Vec<String>,
    pub sensor_keys: Vec<String>,
    pub thresholds: Thresholds,
    pub farms: Vec<FarmEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    pub confirm_delay_ms: u64,
    /// `None` keeps every reading the backend has returned.
    pub history_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FarmEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub greenhouses: Vec<GreenhouseEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreenhouseEntry {
    pub id: String,
    pub name: String,
}

/// The farm/greenhouse pair one SyncCore is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredContext {
    pub farm_id: String,
    pub farm_name: String,
    pub greenhouse_id: String,
    pub greenhouse_name: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            sync: SyncConfig::default(),
            web: WebConfig::default(),
            greenhouse: None,
            devices: ["fan", "pump", "light"].map(String::from).to_vec(),
            sensor_keys: ["temperature", "humidity", "lightIntensity", "soilMoisture"]
                .map(String::from)
                .to_vec(),
            thresholds: default_thresholds(),
            farms: vec![FarmEntry {
                id: "farm-default".into(),
                name: "Default Farm".into(),
                location: None,
                greenhouses: vec![GreenhouseEntry {
                    id: "gh-default".into(),
                    name: "Greenhouse".into(),
                }],
            }],
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            confirm_delay_ms: 1_000,
            history_capacity: Some(5_000),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }
}

/// Minimum accepted poll interval.
const MIN_POLL_INTERVAL_MS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_backend(&mut errors);
        self.validate_sync(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_farms(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_backend(&self, errors: &mut Vec<String>) {
        match reqwest::Url::parse(&self.backend.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            Ok(url) => errors.push(format!(
                "backend.base_url '{}' must be an http(s) URL with a host (scheme '{}')",
                self.backend.base_url,
                url.scheme()
            )),
            Err(e) => errors.push(format!(
                "backend.base_url '{}' is not a valid URL: {e}",
                self.backend.base_url
            )),
        }
        if self.backend.request_timeout_ms == 0 {
            errors.push("backend.request_timeout_ms must be positive".into());
        }
    }

    fn validate_sync(&self, errors: &mut Vec<String>) {
        if self.sync.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            errors.push(format!(
                "sync.poll_interval_ms must be at least {MIN_POLL_INTERVAL_MS}, got {}",
                self.sync.poll_interval_ms
            ));
        }
        if self.sync.confirm_delay_ms == 0 {
            errors.push("sync.confirm_delay_ms must be positive".into());
        }
        if self.sync.history_capacity == Some(0) {
            errors.push("sync.history_capacity must be positive when set".into());
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, d) in self.devices.iter().enumerate() {
            if d.trim().is_empty() {
                errors.push(format!("devices[{i}]: id is empty"));
            } else if !d.chars().all(|c| c.is_ascii_alphanumeric()) {
                errors.push(format!("device '{d}': id must be ASCII alphanumeric"));
            } else if !seen.insert(d) {
                errors.push(format!("device '{d}': duplicate id"));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, k) in self.sensor_keys.iter().enumerate() {
            if k.trim().is_empty() {
                errors.push(format!("sensor_keys[{i}]: key is empty"));
            } else if !seen.insert(k) {
                errors.push(format!("sensor key '{k}': duplicate"));
            }
        }

        for (key, t) in &self.thresholds {
            if !seen.contains(key.as_str()) {
                errors.push(format!(
                    "threshold '{key}': does not match any configured sensor key"
                ));
            }
            if !(t.min.is_finite() && t.max.is_finite()) {
                errors.push(format!("threshold '{key}': min and max must be finite"));
            } else if t.min >= t.max {
                errors.push(format!(
                    "threshold '{key}': min ({}) must be less than max ({})",
                    t.min, t.max
                ));
            }
        }
    }

    fn validate_farms(&self, errors: &mut Vec<String>) {
        let mut farm_ids: HashSet<&str> = HashSet::new();
        let mut greenhouse_ids: HashSet<&str> = HashSet::new();

        for (i, f) in self.farms.iter().enumerate() {
            let ctx = || {
                if f.id.is_empty() {
                    format!("farms[{i}]")
                } else {
                    format!("farm '{}'", f.id)
                }
            };

            if f.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !farm_ids.insert(&f.id) {
                errors.push(format!("{}: duplicate farm id", ctx()));
            }
            if f.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            for (j, g) in f.greenhouses.iter().enumerate() {
                if g.id.trim().is_empty() {
                    errors.push(format!("{}: greenhouses[{j}] id is empty", ctx()));
                } else if !greenhouse_ids.insert(&g.id) {
                    errors.push(format!("{}: duplicate greenhouse id '{}'", ctx(), g.id));
                }
                if g.name.trim().is_empty() {
                    errors.push(format!("{}: greenhouse '{}' name is empty", ctx(), g.id));
                }
            }
        }

        if greenhouse_ids.is_empty() {
            errors.push("no greenhouses configured".into());
        }
        if let Some(wanted) = &self.greenhouse {
            if !greenhouse_ids.is_empty() && !greenhouse_ids.contains(wanted.as_str()) {
                errors.push(format!(
                    "greenhouse '{wanted}' does not match any configured greenhouse"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Overrides & context
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `BACKEND_URL`, `GREENHOUSE_ID` and `WEB_PORT` from `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Some(id) = var("GREENHOUSE_ID") {
            self.greenhouse = Some(id);
        }
        if let Some(port) = var("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a valid port"))?;
        }
        Ok(())
    }

    pub fn monitored_context(&self) -> Result<MonitoredContext> {
        let found = self.farms.iter().find_map(|f| {
            let gh = match &self.greenhouse {
                Some(wanted) => f.greenhouses.iter().find(|g| &g.id == wanted),
                None => f.greenhouses.first(),
            }?;
            Some(MonitoredContext {
                farm_id: f.id.clone(),
                farm_name: f.name.clone(),
                greenhouse_id: gh.id.clone(),
                greenhouse_name: gh.name.clone(),
            })
        });
        found.ok_or_else(|| match &self.greenhouse {
            Some(wanted) => anyhow!("greenhouse '{wanted}' not found"),
            None => anyhow!("no greenhouses configured"),
        })
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, then
/// validate.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_overrides(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        backend = %config.backend.base_url,
        devices = config.devices.len(),
        sensor_keys = config.sensor_keys.len(),
        farms = config.farms.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
