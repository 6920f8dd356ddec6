//! Per-address validation pipeline
//!
//! One address flows through a strictly sequential pipeline: verdict-cache
//! short-circuit, syntax check, MX lookup (cached per domain), then an SMTP
//! probe of each exchanger in preference order. The first definitive
//! answer becomes the verdict.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{MxCache, VerdictCache};
use crate::resolver::MxResolver;
use crate::smtp::{ProbeOutcome, SmtpProber};
use crate::EngineConfig;

/// Verdict for an address whose probe reached `RCPT TO` without rejection,
/// and for addresses none of whose exchangers answered at all.
pub const VERDICT_OK: &str = "OK";

/// Verdict for a syntactically invalid or over-long address.
pub const VERDICT_INVALID: &str = "invalid email address";

/// Verdict for a domain that resolves to an empty MX record list.
pub const VERDICT_NO_MX: &str = "no mx record found";

/// Addresses longer than this are rejected without further inspection.
const MAX_ADDRESS_OCTETS: usize = 255;

/// Validates one email address and produces its verdict string.
pub struct AddressValidator {
    mail_from: String,
    resolver: Arc<dyn MxResolver>,
    prober: Arc<dyn SmtpProber>,
    result_cache: Option<Arc<VerdictCache>>,
    mx_cache: Option<Arc<MxCache>>,
}

impl AddressValidator {
    /// Wire a validator from its collaborators. Pass `None` for a cache to
    /// disable it.
    pub fn new(
        config: &EngineConfig,
        resolver: Arc<dyn MxResolver>,
        prober: Arc<dyn SmtpProber>,
        result_cache: Option<Arc<VerdictCache>>,
        mx_cache: Option<Arc<MxCache>>,
    ) -> Self {
        Self {
            mail_from: config.mail_from.clone(),
            resolver,
            prober,
            result_cache,
            mx_cache,
        }
    }

    /// Run the full pipeline for `email` and return its verdict.
    pub async fn verify(&self, email: &str) -> String {
        if let Some(cache) = &self.result_cache {
            if let Some(verdict) = cache.get(email) {
                debug!(email, verdict = %verdict, "verdict served from cache");
                return verdict;
            }
        }

        if email.len() > MAX_ADDRESS_OCTETS || !syntax::is_valid_email(&email.to_lowercase()) {
            return self.finish(email, VERDICT_INVALID.to_string());
        }

        // a conforming address has an @; the domain is what follows it
        let domain = match email.rsplit_once('@') {
            Some((_, domain)) => domain.to_ascii_lowercase(),
            None => return self.finish(email, VERDICT_INVALID.to_string()),
        };

        let mut fetched_from_cache = false;
        let cached_records = self
            .mx_cache
            .as_ref()
            .and_then(|cache| cache.get(&domain));
        let records = match cached_records {
            Some(records) => {
                fetched_from_cache = true;
                records
            }
            None => match self.resolver.resolve_mx(&domain).await {
                Ok(records) => records,
                // resolution failures are returned verbatim and not cached
                Err(err) => return err.to_string(),
            },
        };

        if !fetched_from_cache {
            if let Some(cache) = &self.mx_cache {
                cache.put(domain.clone(), records.clone());
            }
        }

        if records.is_empty() {
            return VERDICT_NO_MX.to_string();
        }

        for record in &records {
            match self
                .prober
                .probe(&record.host, &domain, &self.mail_from, email)
                .await
            {
                ProbeOutcome::Unreachable => continue,
                ProbeOutcome::Rejected(text) => return self.finish(email, text),
                ProbeOutcome::Delivered => return self.finish(email, VERDICT_OK.to_string()),
            }
        }

        // every exchanger refused the connection; absence of a rejection is
        // treated as deliverable
        self.finish(email, VERDICT_OK.to_string())
    }

    fn finish(&self, email: &str, verdict: String) -> String {
        if let Some(cache) = &self.result_cache {
            cache.put(email.to_string(), verdict.clone());
        }
        verdict
    }
}

mod syntax {
    //! Permissive address grammar: a non-empty local part of common atext
    //! characters (dot-atom form), one `@`, and a dotted domain.

    const LOCAL_SPECIALS: &str = "!#$%&'*+-/=?^_`{|}~";
    const MAX_LOCAL_LEN: usize = 64;
    const MAX_DOMAIN_LEN: usize = 253;

    pub fn is_valid_email(email: &str) -> bool {
        let Some((local, domain)) = email.rsplit_once('@') else {
            return false;
        };
        is_valid_local_part(local) && is_valid_domain(domain)
    }

    fn is_valid_local_part(local: &str) -> bool {
        if local.is_empty() || local.len() > MAX_LOCAL_LEN {
            return false;
        }
        local.split('.').all(|atom| {
            !atom.is_empty()
                && atom
                    .chars()
                    .all(|c| c.is_alphanumeric() || LOCAL_SPECIALS.contains(c))
        })
    }

    fn is_valid_domain(domain: &str) -> bool {
        if domain.len() > MAX_DOMAIN_LEN || !domain.contains('.') {
            return false;
        }
        domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_alphanumeric() || c == '-')
        })
    }
}
