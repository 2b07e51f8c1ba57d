//! Gateway configuration.
//!
//! Loaded from TOML (`config.toml` under the platform config directory by
//! default), then overlaid with a small set of environment variables:
//!
//! | Variable | Overrides |
//! |---|---|
//! | `CAG_PROVIDER_URL` | `provider.base_url` |
//! | `CAG_PROVIDER_MODEL` | `provider.model` |
//! | `CAG_ADMIN_TOKEN` | `gateway.admin_token` |
//! | `CAG_AUDIT_DB` | `audit.db_path` |

pub mod schema;

pub use schema::{
    AuditConfig, CacheConfig, Config, GatewayConfig, LoggingConfig, MonitorConfig,
    ProviderConfig, RateLimitConfig, RiskConfig, RiskWeights, RulesConfig, SanitizerConfig,
    SessionConfig, TaskPolicy, TaskTable,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "clinical-ai-gateway", "clinical-ai-gateway")
}

/// Default config file location (`<config_dir>/config.toml`).
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Default directory for the audit database.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".clinical-ai-gateway"))
}

impl Config {
    /// Load config from `path` (or the default location). A missing file
    /// yields defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            Self::from_toml(&raw)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// JSON Schema of the config file, for editor tooling.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    fn apply_env_overrides(&mut self) {
        fn env_nonempty(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        if let Some(url) = env_nonempty("CAG_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = env_nonempty("CAG_PROVIDER_MODEL") {
            self.provider.model = model;
        }
        if let Some(token) = env_nonempty("CAG_ADMIN_TOKEN") {
            self.gateway.admin_token = Some(token);
        }
        if let Some(db) = env_nonempty("CAG_AUDIT_DB") {
            self.audit.db_path = Some(PathBuf::from(db));
        }
    }

    /// Reject configurations that would make the pipeline unsafe or inert.
    pub fn validate(&self) -> Result<()> {
        if self.risk.block_threshold == 0 {
            anyhow::bail!("risk.block_threshold must be greater than zero");
        }
        if self.risk.red_min <= self.risk.yellow_min {
            anyhow::bail!(
                "risk.red_min ({}) must be greater than risk.yellow_min ({})",
                self.risk.red_min,
                self.risk.yellow_min
            );
        }
        if self.risk.warn_threshold >= self.risk.block_threshold {
            anyhow::bail!(
                "risk.warn_threshold ({}) must be below risk.block_threshold ({})",
                self.risk.warn_threshold,
                self.risk.block_threshold
            );
        }
        if self.session.escalation_threshold == 0 {
            anyhow::bail!("session.escalation_threshold must be at least 1");
        }
        if self.sanitizer.max_length == 0 {
            anyhow::bail!("sanitizer.max_length must be greater than zero");
        }
        if self.tasks.0.is_empty() {
            anyhow::bail!("at least one task must be configured under [tasks]");
        }
        match self.audit.backend.as_str() {
            "sqlite" | "memory" => {}
            other => anyhow::bail!("Unknown audit backend '{other}'. Supported: sqlite, memory"),
        }
        Ok(())
    }

    /// Resolved audit database path.
    pub fn audit_db_path(&self) -> PathBuf {
        self.audit
            .db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("audit.db"))
    }

    /// Whether `role` may invoke `task`. Unknown tasks are never allowed.
    pub fn role_allowed(&self, task: &str, role: &str) -> bool {
        self.tasks
            .get(task)
            .is_some_and(|policy| policy.roles.iter().any(|r| r.eq_ignore_ascii_case(role)))
    }

    /// Whether errors on `task` escalate one severity level.
    pub fn is_clinical_task(&self, task: &str) -> bool {
        self.tasks.get(task).is_some_and(|policy| policy.clinical)
    }
}
