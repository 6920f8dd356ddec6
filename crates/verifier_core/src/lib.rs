//! # verifier_core
//!
//! Batch email-address verification engine. A submitted address runs through
//! a sequential pipeline (syntax check, MX resolution, SMTP probe up to
//! `RCPT TO`) and receives a short textual verdict. Verdicts are cached per
//! address and MX records per domain so repeated batches amortize DNS and
//! SMTP cost.
//!
//! ## Features
//!
//! - **Bounded FIFO caches** with timer-driven full flush
//! - **MX resolution** via hickory-resolver behind an injectable trait
//! - **SMTP probing** with opportunistic STARTTLS upgrade
//! - **Bounded worker pool** draining a batch through a channel
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use verifier_core::{
//!     AddressValidator, BatchEngine, EngineConfig, HickoryMxResolver, NetworkProber,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let resolver = Arc::new(HickoryMxResolver::from_system_conf()?);
//!     let prober = Arc::new(NetworkProber::new(
//!         config.connect_timeout(),
//!         config.danger_accept_invalid_certs,
//!     ));
//!     let validator = AddressValidator::new(&config, resolver, prober, None, None);
//!     let engine = BatchEngine::new(Arc::new(validator), &config);
//!
//!     let verdicts = engine.run(vec!["user@example.com".to_string()]).await;
//!     println!("{:?}", verdicts.get("user@example.com"));
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod resolver;
pub mod smtp;
pub mod validator;

use std::time::Duration;

/// Knobs for one of the two engine caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether the cache is consulted and written at all
    pub enabled: bool,
    /// Seconds between full flushes; zero disables the flush timer
    pub gc_frequency_secs: u64,
    /// Maximum number of entries held at any time
    pub max_size: usize,
}

impl CacheConfig {
    /// Flush period as a `Duration`, `None` when the timer is disabled.
    pub fn gc_period(&self) -> Option<Duration> {
        (self.gc_frequency_secs > 0).then(|| Duration::from_secs(self.gc_frequency_secs))
    }
}

/// Configuration for the verification engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrent validators per batch
    pub workers: usize,
    /// Capacity of the channel feeding the workers
    pub buffer_size: usize,
    /// Envelope sender used in SMTP `MAIL FROM`
    pub mail_from: String,
    /// Per-address verdict cache
    pub result_cache: CacheConfig,
    /// Per-domain MX record cache
    pub mx_cache: CacheConfig,
    /// Seconds allowed for the TCP connect to a mail exchanger
    pub connect_timeout_secs: u64,
    /// Skip certificate verification on STARTTLS upgrades. Probing is
    /// best-effort; most exchangers present certificates that do not match
    /// the recipient domain, so verification is off by default.
    pub danger_accept_invalid_certs: bool,
    /// Log a line per finished verification at info level
    pub verbose: bool,
    /// Append ` [took <duration>]` to every verdict
    pub verdict_duration: bool,
}

impl EngineConfig {
    /// TCP connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            buffer_size: 64,
            mail_from: "noreply@domain.com".to_string(),
            result_cache: CacheConfig {
                enabled: true,
                gc_frequency_secs: 86_400,
                max_size: 10_000,
            },
            mx_cache: CacheConfig {
                enabled: true,
                gc_frequency_secs: 2_592_000,
                max_size: 1_000,
            },
            connect_timeout_secs: 5,
            danger_accept_invalid_certs: true,
            verbose: false,
            verdict_duration: false,
        }
    }
}

// Re-export main types
pub use batch::{BatchEngine, VerdictReport};
pub use cache::{spawn_flush_timer, BoundedCache, MxCache, VerdictCache};
pub use resolver::{HickoryMxResolver, MxRecord, MxResolver, ResolverError};
pub use smtp::{NetworkProber, ProbeOutcome, SmtpProber};
pub use validator::{AddressValidator, VERDICT_INVALID, VERDICT_NO_MX, VERDICT_OK};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 32);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.mail_from, "noreply@domain.com");
        assert_eq!(config.connect_timeout_secs, 5);
        assert!(config.danger_accept_invalid_certs);
        assert!(!config.verbose);
        assert!(!config.verdict_duration);
    }

    #[test]
    fn test_cache_config_defaults() {
        let config = EngineConfig::default();
        assert!(config.result_cache.enabled);
        assert_eq!(config.result_cache.max_size, 10_000);
        assert_eq!(config.result_cache.gc_frequency_secs, 86_400);
        assert!(config.mx_cache.enabled);
        assert_eq!(config.mx_cache.max_size, 1_000);
    }

    #[test]
    fn test_gc_period_zero_disables_timer() {
        let cache = CacheConfig {
            enabled: true,
            gc_frequency_secs: 0,
            max_size: 10,
        };
        assert_eq!(cache.gc_period(), None);

        let cache = CacheConfig {
            enabled: true,
            gc_frequency_secs: 60,
            max_size: 10,
        };
        assert_eq!(cache.gc_period(), Some(Duration::from_secs(60)));
    }
}
