use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persisted run defaults. Every field is optional so that a partial file only
/// overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential_backoff: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RunSettings {
    fn normalize(&mut self) {
        self.label = self.label.as_ref().map(|s| s.trim().to_string());
        if matches!(self.label.as_deref(), Some(s) if s.is_empty()) {
            self.label = None;
        }
    }

    /// Layer `overrides` on top of `self`; fields set in `overrides` win.
    pub fn merged_with(&self, overrides: &RunSettings) -> RunSettings {
        let mut out = RunSettings {
            batch_size: overrides.batch_size.or(self.batch_size),
            concurrency: overrides.concurrency.or(self.concurrency),
            continue_on_error: overrides.continue_on_error.or(self.continue_on_error),
            retry_attempts: overrides.retry_attempts.or(self.retry_attempts),
            retry_delay_ms: overrides.retry_delay_ms.or(self.retry_delay_ms),
            max_retry_delay_ms: overrides.max_retry_delay_ms.or(self.max_retry_delay_ms),
            exponential_backoff: overrides.exponential_backoff.or(self.exponential_backoff),
            label: overrides.label.clone().or_else(|| self.label.clone()),
        };
        out.normalize();
        out
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("batchflow").join("config.json"))
}

pub fn parse_settings(raw: &str) -> anyhow::Result<RunSettings> {
    let mut cfg: RunSettings = serde_json::from_str(raw)?;
    cfg.normalize();
    Ok(cfg)
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Option<RunSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    parse_settings(&raw).map(Some)
}

/// Load settings from the default location, if a file exists there.
pub fn load_settings() -> anyhow::Result<Option<RunSettings>> {
    load_settings_from(&settings_path()?)
}

pub fn save_settings_to(path: &Path, cfg: &RunSettings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Save settings to the default location and return the path written.
pub fn save_settings(cfg: &RunSettings) -> anyhow::Result<PathBuf> {
    let path = settings_path()?;
    save_settings_to(&path, cfg)?;
    Ok(path)
}
