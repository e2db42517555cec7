//! Top-level gateway configuration: the core runtime [`Config`] plus the
//! MCP server list, which lives in its own crate (`ra-mcp`) and is kept
//! separate from `ra_domain::config::Config` on purpose — the MCP
//! transport is bus-based and has nothing else in common with the core
//! runtime knobs.

use ra_domain::config::{Config, ConfigSeverity};
use ra_mcp::McpConfig;
use serde::{Deserialize, Serialize};

/// Everything the gateway binary needs to boot, loaded from one TOML
/// file. `core` mirrors every field of `Config`; `mcp` is a sibling
/// table rather than a nested field of `Config` itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub core: Config,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl GatewayConfig {
    pub fn validate(&self) -> Vec<ra_domain::config::ConfigError> {
        self.core.validate()
    }
}

/// Load the configuration from the path named by `RA_CONFIG` (or
/// `config.toml` by default), falling back to defaults if the file is
/// absent.
pub fn load_config() -> anyhow::Result<(GatewayConfig, String)> {
    let config_path = std::env::var("RA_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        GatewayConfig::default()
    };

    Ok((config, config_path))
}

pub fn log_validation_issues(issues: &[ra_domain::config::ConfigError]) {
    for issue in issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
}
