//! Bounded cache over subject → (handle, PDS endpoint) lookups against the
//! PLC directory.
//!
//! Positive entries live for 12 hours, negative entries for 2 minutes; an
//! entry that has gone stale is still served if the upstream lookup fails.
//! A token-bucket limiter protects the directory.

use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use reqwest::StatusCode;
use spyglass_common::RateLimiter;
use spyglass_types::did_doc::DidDocument;

const CACHE_CAPACITY: u64 = 250_000;
/// Positive entries are trusted for this long; it is also the window in
/// which a stale entry may be served after an upstream failure.
const POSITIVE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const NEGATIVE_TTL: Duration = Duration::from_secs(2 * 60);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub did: String,
    pub handle: String,
    pub pds: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: Option<ResolvedIdentity>,
    fetched_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        match self.identity {
            // Positive entries are evicted by the cache TTL itself.
            Some(_) => true,
            None => self.fetched_at.elapsed() < NEGATIVE_TTL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response status: {0}")]
    Status(StatusCode),
}

pub struct IdentityResolver {
    http: reqwest::Client,
    plc_host: String,
    limiter: RateLimiter,
    cache: Cache<String, CacheEntry>,
}

impl IdentityResolver {
    pub fn new(plc_host: impl Into<String>, rate_limit: f64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .user_agent(crate::USER_AGENT)
            .build()
            .expect("reqwest client");
        let cache = Cache::builder()
            .eviction_policy(EvictionPolicy::lru())
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(POSITIVE_TTL)
            .build();
        Self {
            http,
            plc_host: plc_host.into().trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(rate_limit, 1),
            cache,
        }
    }

    /// Resolves a subject identifier. The boolean is true when the answer
    /// was served from cache (fresh or stale), so callers can skip
    /// re-persisting identities they already stored.
    pub async fn resolve(&self, did: &str) -> Result<(Option<ResolvedIdentity>, bool), Error> {
        if let Some(entry) = self.cache.get(did).await {
            if entry.is_fresh() {
                return Ok((entry.identity, true));
            }
        }

        self.limiter.acquire().await;
        match self.fetch(did).await {
            Ok(identity) => {
                self.cache
                    .insert(
                        did.to_string(),
                        CacheEntry { identity: identity.clone(), fetched_at: Instant::now() },
                    )
                    .await;
                Ok((identity, false))
            }
            Err(err) => {
                // Stale-on-error: serve whatever we still have.
                if let Some(entry) = self.cache.get(did).await {
                    tracing::warn!(did, err = %err, "identity lookup failed, serving stale entry");
                    return Ok((entry.identity, true));
                }
                Err(err)
            }
        }
    }

    /// Drops the cache entry for a subject, forcing the next resolve to hit
    /// the directory.
    pub async fn purge(&self, did: &str) {
        self.cache.invalidate(did).await;
    }

    async fn fetch(&self, did: &str) -> Result<Option<ResolvedIdentity>, Error> {
        let url = format!("{}/{}", self.plc_host, did);
        let response = self.http.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Status(response.status()));
        }

        let doc: DidDocument = response.json().await?;
        Ok(Some(ResolvedIdentity {
            did: did.to_string(),
            handle: doc.handle().unwrap_or_default().to_string(),
            pds: doc.pds_endpoint().unwrap_or_default().to_string(),
        }))
    }
}
