use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub transient_base_delay_ms: u64,
    pub transient_max_delay_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            max_attempts: 5,
            transient_base_delay_ms: 500,
            transient_max_delay_ms: 30_000,
        }
    }
}

impl GovernorConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn transient_base_delay(&self) -> Duration {
        Duration::from_millis(self.transient_base_delay_ms)
    }

    pub fn transient_max_delay(&self) -> Duration {
        Duration::from_millis(self.transient_max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Window fetched by a first incremental sync when no cursor exists.
    pub default_days: u32,
    pub page_size: u32,
    pub dm_limit: u32,
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_days: 30,
            page_size: 100,
            dm_limit: 100,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementConfig {
    pub window_days: u32,
    /// Case-insensitive substrings; a member holding a matching role counts
    /// as a moderator.
    pub moderator_roles: Vec<String>,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            moderator_roles: ["moderator", "mod", "admin", "staff", "owner"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommsyncConfig {
    pub governor: GovernorConfig,
    pub sync: SyncSettings,
    pub engagement: EngagementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCommsyncConfig {
    governor: Option<GovernorConfig>,
    sync: Option<SyncSettings>,
    engagement: Option<EngagementConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

pub fn validate(cfg: &CommsyncConfig) -> Result<()> {
    if cfg.governor.max_attempts == 0 {
        return Err(anyhow!("invalid governor max attempts: must be >= 1"));
    }
    if cfg.governor.transient_base_delay_ms == 0 {
        return Err(anyhow!("invalid transient base delay: must be >= 1 ms"));
    }
    if cfg.governor.transient_max_delay_ms < cfg.governor.transient_base_delay_ms {
        return Err(anyhow!(
            "invalid transient delays: require base <= max"
        ));
    }
    if cfg.sync.page_size == 0 || cfg.sync.page_size > 100 {
        return Err(anyhow!("invalid page size: require 1 <= page_size <= 100"));
    }
    if cfg.sync.dm_limit == 0 {
        return Err(anyhow!("invalid dm limit: must be >= 1"));
    }
    if cfg.sync.concurrency == 0 || cfg.sync.concurrency > 64 {
        return Err(anyhow!("invalid concurrency: require 1 <= concurrency <= 64"));
    }
    if cfg.engagement.window_days == 0 {
        return Err(anyhow!("invalid engagement window: must be >= 1 day"));
    }
    Ok(())
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("COMMSYNC_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".commsync").join("commsync.toml"))
}

fn merge_toml(base: &mut CommsyncConfig, raw: &str) -> Result<()> {
    let parsed: PartialCommsyncConfig = toml::from_str(raw)?;
    if let Some(governor) = parsed.governor {
        base.governor = governor;
    }
    if let Some(sync) = parsed.sync {
        base.sync = sync;
    }
    if let Some(engagement) = parsed.engagement {
        base.engagement = engagement;
    }
    Ok(())
}

fn merge_file_config(base: &mut CommsyncConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    merge_toml(base, &raw)
        .map_err(|err| anyhow!("failed to parse commsync config {}: {err}", path.display()))
}

fn apply_env_overrides(cfg: &mut CommsyncConfig) {
    cfg.governor.min_interval_ms =
        env_or_u64("COMMSYNC_MIN_INTERVAL_MS", cfg.governor.min_interval_ms);
    cfg.governor.max_attempts = env_or_u32("COMMSYNC_MAX_ATTEMPTS", cfg.governor.max_attempts);
    cfg.governor.transient_base_delay_ms = env_or_u64(
        "COMMSYNC_TRANSIENT_BASE_DELAY_MS",
        cfg.governor.transient_base_delay_ms,
    );
    cfg.governor.transient_max_delay_ms = env_or_u64(
        "COMMSYNC_TRANSIENT_MAX_DELAY_MS",
        cfg.governor.transient_max_delay_ms,
    );
    cfg.sync.default_days = env_or_u32("COMMSYNC_DEFAULT_DAYS", cfg.sync.default_days);
    cfg.sync.page_size = env_or_u32("COMMSYNC_PAGE_SIZE", cfg.sync.page_size);
    cfg.sync.dm_limit = env_or_u32("COMMSYNC_DM_LIMIT", cfg.sync.dm_limit);
    cfg.sync.concurrency =
        env_or_u64("COMMSYNC_CONCURRENCY", cfg.sync.concurrency as u64) as usize;
    cfg.engagement.window_days =
        env_or_u32("COMMSYNC_ENGAGEMENT_WINDOW_DAYS", cfg.engagement.window_days);
    cfg.engagement.moderator_roles =
        env_or_csv("COMMSYNC_MODERATOR_ROLES", &cfg.engagement.moderator_roles);
}

pub fn load_config() -> Result<CommsyncConfig> {
    let mut cfg = CommsyncConfig::default();
    merge_file_config(&mut cfg)?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}
