//! Configuration loading for the verification API
//!
//! Defaults are overlaid with `config.json` next to the executable (when
//! present) and then with command-line flags of the same dotted names, so
//! `--work.workers 8` beats `"work.workers": 16` in the file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use figment::providers::{Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use verifier_core::{CacheConfig, EngineConfig};

const CONFIG_FILE: &str = "config.json";

/// Main application configuration. Field names mirror the keys accepted in
/// `config.json` and on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bind address; empty binds all interfaces
    #[serde(rename = "server.ip")]
    pub ip: String,
    /// Bind port
    #[serde(rename = "server.port")]
    pub port: u16,
    /// Required `Authorization` header value; empty disables auth
    #[serde(rename = "server.password")]
    pub password: String,
    /// Maximum concurrent validators per batch
    #[serde(rename = "work.workers")]
    pub workers: usize,
    /// Capacity of the channel feeding the workers
    #[serde(rename = "work.buffersize")]
    pub buffer_size: usize,
    /// Envelope sender for SMTP `MAIL FROM`
    #[serde(rename = "email.from")]
    pub mail_from: String,
    /// Whether verdicts are cached per address
    #[serde(rename = "emails.cache.enabled")]
    pub emails_cache_enabled: bool,
    /// Seconds between verdict cache flushes; zero disables the timer
    #[serde(rename = "emails.cache.gcfrequency")]
    pub emails_cache_gc_frequency: u64,
    /// Verdict cache capacity
    #[serde(rename = "emails.cache.maxsize")]
    pub emails_cache_max_size: usize,
    /// Whether MX record lists are cached per domain
    #[serde(rename = "domains.mxcache.enabled")]
    pub mx_cache_enabled: bool,
    /// Seconds between MX cache flushes; zero disables the timer
    #[serde(rename = "domains.mxcache.gcfrequency")]
    pub mx_cache_gc_frequency: u64,
    /// MX cache capacity
    #[serde(rename = "domains.mxcache.maxsize")]
    pub mx_cache_max_size: usize,
    /// Seconds allowed for the TCP connect to a mail exchanger
    #[serde(rename = "domains.mxquery.timeout")]
    pub mx_query_timeout_secs: u64,
    /// Skip certificate verification on STARTTLS upgrades
    #[serde(rename = "smtp.tls.danger_accept_invalid_certs")]
    pub danger_accept_invalid_certs: bool,
    /// Log a line per finished verification
    pub verbose: bool,
    /// Append ` [took <duration>]` to every verdict
    pub vduration: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            ip: "127.0.0.1".to_string(),
            port: 8000,
            password: String::new(),
            workers: engine.workers,
            buffer_size: engine.buffer_size,
            mail_from: engine.mail_from,
            emails_cache_enabled: engine.result_cache.enabled,
            emails_cache_gc_frequency: engine.result_cache.gc_frequency_secs,
            emails_cache_max_size: engine.result_cache.max_size,
            mx_cache_enabled: engine.mx_cache.enabled,
            mx_cache_gc_frequency: engine.mx_cache.gc_frequency_secs,
            mx_cache_max_size: engine.mx_cache.max_size,
            mx_query_timeout_secs: engine.connect_timeout_secs,
            danger_accept_invalid_certs: engine.danger_accept_invalid_certs,
            verbose: engine.verbose,
            vduration: engine.verdict_duration,
        }
    }
}

impl AppConfig {
    /// The engine-facing view of this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers,
            buffer_size: self.buffer_size,
            mail_from: self.mail_from.clone(),
            result_cache: CacheConfig {
                enabled: self.emails_cache_enabled,
                gc_frequency_secs: self.emails_cache_gc_frequency,
                max_size: self.emails_cache_max_size,
            },
            mx_cache: CacheConfig {
                enabled: self.mx_cache_enabled,
                gc_frequency_secs: self.mx_cache_gc_frequency,
                max_size: self.mx_cache_max_size,
            },
            connect_timeout_secs: self.mx_query_timeout_secs,
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            verbose: self.verbose,
            verdict_duration: self.vduration,
        }
    }
}

/// Command-line overrides; every flag shares its name with the matching
/// `config.json` key.
#[derive(Debug, Parser)]
#[command(name = "verifier-api", version, about = "Batch email verification service")]
pub struct CliOverrides {
    #[arg(long = "server.ip", value_name = "ADDR")]
    ip: Option<String>,
    #[arg(long = "server.port", value_name = "PORT")]
    port: Option<u16>,
    #[arg(long = "server.password", value_name = "PASSWORD")]
    password: Option<String>,
    #[arg(long = "work.workers", value_name = "N")]
    workers: Option<usize>,
    #[arg(long = "work.buffersize", value_name = "N")]
    buffer_size: Option<usize>,
    #[arg(long = "email.from", value_name = "ADDRESS")]
    mail_from: Option<String>,
    #[arg(long = "emails.cache.enabled", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    emails_cache_enabled: Option<bool>,
    #[arg(long = "emails.cache.gcfrequency", value_name = "SECONDS")]
    emails_cache_gc_frequency: Option<u64>,
    #[arg(long = "emails.cache.maxsize", value_name = "N")]
    emails_cache_max_size: Option<usize>,
    #[arg(long = "domains.mxcache.enabled", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    mx_cache_enabled: Option<bool>,
    #[arg(long = "domains.mxcache.gcfrequency", value_name = "SECONDS")]
    mx_cache_gc_frequency: Option<u64>,
    #[arg(long = "domains.mxcache.maxsize", value_name = "N")]
    mx_cache_max_size: Option<usize>,
    #[arg(long = "domains.mxquery.timeout", value_name = "SECONDS")]
    mx_query_timeout_secs: Option<u64>,
    #[arg(long = "smtp.tls.danger_accept_invalid_certs", value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    danger_accept_invalid_certs: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    vduration: Option<bool>,
}

impl CliOverrides {
    fn apply(self, config: &mut AppConfig) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }
        overlay!(
            ip,
            port,
            password,
            workers,
            buffer_size,
            mail_from,
            emails_cache_enabled,
            emails_cache_gc_frequency,
            emails_cache_max_size,
            mx_cache_enabled,
            mx_cache_gc_frequency,
            mx_cache_max_size,
            mx_query_timeout_secs,
            danger_accept_invalid_certs,
            verbose,
            vduration,
        );
    }
}

/// Load the effective configuration: defaults, then the config file, then
/// command-line flags.
pub fn load_config() -> anyhow::Result<AppConfig> {
    let mut config = load_file_config(config_file_path())?;
    CliOverrides::parse().apply(&mut config);
    Ok(config)
}

fn load_file_config(path: PathBuf) -> anyhow::Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
    if path.exists() {
        figment = figment.merge(Json::file(&path));
    }
    figment
        .extract()
        .with_context(|| format!("reading configuration from {}", path.display()))
}

/// `config.json` lives next to the executable, not in the working
/// directory.
fn config_file_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE)))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}
