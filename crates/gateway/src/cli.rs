//! Command-line surface. Grounded on the teacher's `cli/mod.rs` +
//! `cli/config.rs`, trimmed to the subset this gateway actually needs:
//! serving, and inspecting/validating the resolved configuration.

use clap::{Parser, Subcommand};

use crate::config::GatewayConfig;
use ra_domain::config::ConfigSeverity;

#[derive(Debug, Parser)]
#[command(name = "ra-gateway", version, about = "Red AI conversational orchestration gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the HTTP gateway (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any validation issues.
    Validate,
    /// Dump the resolved configuration (with defaults filled in) as TOML.
    Show,
}

/// Parse and validate the config, printing any issues. Returns `true` when
/// no `ConfigSeverity::Error` issue was found.
pub fn validate(config: &GatewayConfig, config_path: &str) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }

    println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");
    error_count == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &GatewayConfig) {
    match toml::to_string_pretty(config) {
        Ok(output) => print!("{output}"),
        Err(error) => {
            eprintln!("failed to serialize config: {error}");
            std::process::exit(1);
        }
    }
}
