//! MX resolution behind an injectable trait
//!
//! The engine only ever asks one question of DNS: which hosts exchange mail
//! for a domain. The trait keeps that seam narrow so tests can substitute a
//! deterministic resolver; production uses hickory-resolver.

use async_trait::async_trait;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::debug;

/// One mail exchanger for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Exchanger host name, possibly with a trailing dot
    pub host: String,
    /// MX preference, lower is tried first
    pub priority: u16,
}

/// A resolution failure whose text becomes the verdict for the address.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ResolverError {
    message: String,
}

impl ResolverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Capability interface for MX lookups.
///
/// A domain with no MX records resolves to an empty list, not an error;
/// errors are reserved for lookups that could not complete.
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolverError>;
}

/// MX resolver backed by hickory-resolver and the system DNS configuration.
pub struct HickoryMxResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryMxResolver {
    /// Build a resolver from `/etc/resolv.conf` (or the platform
    /// equivalent).
    pub fn from_system_conf() -> Result<Self, ResolverError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ResolverError::new(e.to_string()))?;
        Ok(Self { resolver })
    }

    /// Wrap an already-configured resolver.
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolverError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut records: Vec<MxRecord> = lookup
                    .iter()
                    .map(|mx| MxRecord {
                        host: mx.exchange().to_utf8(),
                        priority: mx.preference(),
                    })
                    .collect();
                // preference order, the order probes will run in
                records.sort_by_key(|r| r.priority);
                debug!(domain, count = records.len(), "mx lookup completed");
                Ok(records)
            }
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    debug!(domain, "mx lookup found no records");
                    Ok(Vec::new())
                }
                _ => {
                    debug!(domain, error = %err, "mx lookup failed");
                    Err(ResolverError::new(err.to_string()))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolver_error_display_is_message() {
        let err = ResolverError::new("lookup timed out");
        assert_eq!(err.to_string(), "lookup timed out");
    }

    #[test]
    fn test_mx_record_value_equality() {
        let a = MxRecord {
            host: "mx.x.test.".to_string(),
            priority: 10,
        };
        let b = MxRecord {
            host: "mx.x.test.".to_string(),
            priority: 10,
        };
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_system_conf_resolver_construction() {
        // constructing the resolver reads resolv.conf but performs no
        // network I/O
        assert!(HickoryMxResolver::from_system_conf().is_ok());
    }
}
