//! CLI and config-file parsing (spec.md §6's external CLI surface).
//!
//! Out of scope for the spec's core per §1 ("command-line/config parsing...
//! treated as an external collaborator with only its interface contract
//! specified"), but carried here as the ambient stack SPEC_FULL.md §2
//! requires regardless of Non-goals. `clap`'s derive macro gives the exact
//! flag surface from §6's table; a `--config <path>` TOML file (`toml` +
//! `serde`) supplies the same keys, overridden by whatever was passed
//! explicitly on the command line — mirroring `boost::program_options`'s
//! file + CLI composition in `original_source/src/core/options.h` without
//! carrying over its API.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Parser)]
#[command(name = "fiberweb", version, about = "HTTP/1 and HTTP/2 server with script-authored handlers")]
pub struct CliArgs {
    /// Validate configuration and exit.
    #[arg(long = "test")]
    pub test: bool,

    /// Load further options from a TOML file; CLI flags take precedence
    /// over anything set there.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Run HTTP/1 instead of the default HTTP/2.
    #[arg(long = "server.http1")]
    pub server_http1: bool,

    #[arg(long = "server.workers")]
    pub server_workers: Option<usize>,

    #[arg(long = "server.listen")]
    pub server_listen: Option<String>,

    #[arg(long = "server.port")]
    pub server_port: Option<String>,

    #[arg(long = "server.backlog")]
    pub server_backlog: Option<u32>,

    #[arg(long = "server.tls")]
    pub server_tls: bool,

    #[arg(long = "server.key-file")]
    pub server_key_file: Option<PathBuf>,

    #[arg(long = "server.crt-file")]
    pub server_crt_file: Option<PathBuf>,

    #[arg(long = "server.dns-cache-ttl")]
    pub server_dns_cache_ttl: Option<u64>,

    #[arg(long = "lua.root")]
    pub lua_root: Option<PathBuf>,

    #[arg(long = "lua.statebuffer")]
    pub lua_statebuffer: Option<usize>,

    #[arg(long = "lua.devmode")]
    pub lua_devmode: bool,

    #[arg(long = "log.syslog")]
    pub log_syslog: bool,

    #[arg(long = "log.level")]
    pub log_level: Option<u8>,

    #[arg(long = "metrics.log")]
    pub metrics_log: Option<u64>,

    #[arg(long = "metrics.graphite")]
    pub metrics_graphite: bool,

    #[arg(long = "metrics.graphite.host")]
    pub metrics_graphite_host: Option<String>,

    #[arg(long = "metrics.graphite.port")]
    pub metrics_graphite_port: Option<u16>,

    #[arg(long = "metrics.graphite.interval")]
    pub metrics_graphite_interval: Option<u64>,

    #[arg(long = "metrics.graphite.prefix")]
    pub metrics_graphite_prefix: Option<String>,
}

/// The same keys as [`CliArgs`], shaped for TOML: `[server]`, `[lua]`,
/// `[log]`, `[metrics]` tables.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub lua: LuaSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerSection {
    pub http1: Option<bool>,
    pub workers: Option<usize>,
    pub listen: Option<String>,
    pub port: Option<String>,
    pub backlog: Option<u32>,
    pub tls: Option<bool>,
    pub key_file: Option<PathBuf>,
    pub crt_file: Option<PathBuf>,
    pub dns_cache_ttl: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LuaSection {
    pub root: Option<PathBuf>,
    pub statebuffer: Option<usize>,
    pub devmode: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogSection {
    pub syslog: Option<bool>,
    pub level: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsSection {
    pub log: Option<u64>,
    pub graphite: Option<bool>,
    pub graphite_host: Option<String>,
    pub graphite_port: Option<u16>,
    pub graphite_interval: Option<u64>,
    pub graphite_prefix: Option<String>,
}

/// Fully-resolved configuration: every field defaulted, CLI overriding file
/// overriding built-in default, exactly as SPEC_FULL.md §2 describes.
#[derive(Debug, Clone)]
pub struct Config {
    pub test_only: bool,
    pub http1: bool,
    pub workers: usize,
    pub listen: String,
    pub port: String,
    pub backlog: u32,
    pub tls: bool,
    pub key_file: Option<PathBuf>,
    pub crt_file: Option<PathBuf>,
    pub dns_cache_ttl_secs: u64,
    pub lua_root: Option<PathBuf>,
    pub lua_statebuffer: usize,
    pub lua_devmode: bool,
    pub log_syslog: bool,
    pub log_level: u8,
    pub metrics_log_secs: u64,
    pub metrics_graphite: bool,
}

impl Config {
    /// Resolves CLI args plus an optional config file into a final
    /// [`Config`], CLI values always winning over file values.
    pub fn resolve(args: &CliArgs) -> Result<Config, ConfigError> {
        let file = match &args.config {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        if args.server_tls && (args.server_key_file.is_none() && file.server.key_file.is_none()) {
            return Err(ConfigError::InvalidValue {
                flag: "--server.tls".to_string(),
                value: "requires --server.key-file".to_string(),
            });
        }

        Ok(Config {
            test_only: args.test,
            http1: args.server_http1 || file.server.http1.unwrap_or(false),
            workers: args.server_workers.or(file.server.workers).unwrap_or(0),
            listen: args
                .server_listen
                .clone()
                .or(file.server.listen)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: args
                .server_port
                .clone()
                .or(file.server.port)
                .unwrap_or_else(|| "8080".to_string()),
            backlog: args.server_backlog.or(file.server.backlog).unwrap_or(0),
            tls: args.server_tls || file.server.tls.unwrap_or(false),
            key_file: args.server_key_file.clone().or(file.server.key_file),
            crt_file: args.server_crt_file.clone().or(file.server.crt_file),
            dns_cache_ttl_secs: args
                .server_dns_cache_ttl
                .or(file.server.dns_cache_ttl)
                .map(|minutes| minutes * 60)
                .unwrap_or(300),
            lua_root: args.lua_root.clone().or(file.lua.root),
            lua_statebuffer: args.lua_statebuffer.or(file.lua.statebuffer).unwrap_or(8),
            lua_devmode: args.lua_devmode || file.lua.devmode.unwrap_or(false),
            log_syslog: args.log_syslog || file.log.syslog.unwrap_or(false),
            log_level: args.log_level.or(file.log.level).unwrap_or(6),
            metrics_log_secs: args.metrics_log.or(file.metrics.log).unwrap_or(0),
            metrics_graphite: args.metrics_graphite || file.metrics.graphite.unwrap_or(false),
        })
    }

    /// Resolves the configured worker count: the configured value, or the
    /// CPU count if 0, with a floor of 1 (spec.md §4.7 step 1).
    pub fn resolved_worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigFile {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::ConfigFile {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> CliArgs {
        CliArgs::parse_from(["fiberweb"])
    }

    #[test]
    fn defaults_apply_with_no_flags_or_file() {
        let config = Config::resolve(&bare_args()).unwrap();
        assert!(!config.http1);
        assert_eq!(config.port, "8080");
        assert_eq!(config.dns_cache_ttl_secs, 300);
        assert_eq!(config.lua_statebuffer, 8);
    }

    #[test]
    fn worker_count_falls_back_to_cpu_count() {
        let config = Config::resolve(&bare_args()).unwrap();
        assert_eq!(config.workers, 0);
        assert!(config.resolved_worker_count() >= 1);
    }

    #[test]
    fn cli_flag_overrides_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiberweb.toml");
        std::fs::write(&path, "[server]\nport = \"9000\"\n").unwrap();

        let args = CliArgs::parse_from(["fiberweb", "--config", path.to_str().unwrap(), "--server.port", "7000"]);
        let config = Config::resolve(&args).unwrap();
        assert_eq!(config.port, "7000");
    }

    #[test]
    fn file_value_applies_when_cli_flag_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiberweb.toml");
        std::fs::write(&path, "[server]\nport = \"9000\"\n").unwrap();

        let args = CliArgs::parse_from(["fiberweb", "--config", path.to_str().unwrap()]);
        let config = Config::resolve(&args).unwrap();
        assert_eq!(config.port, "9000");
    }

    #[test]
    fn tls_without_key_file_is_rejected() {
        let args = CliArgs::parse_from(["fiberweb", "--server.tls"]);
        assert!(matches!(Config::resolve(&args), Err(ConfigError::InvalidValue { .. })));
    }
}
