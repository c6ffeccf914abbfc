//! Bounded-concurrency archive fetch engine.
//!
//! Every retrieval goes through [`FetchEngine::fetch`]: cache check first,
//! then the network under a global worker budget, a per-host connection cap,
//! and per-host pacing. Transient failures retry with exponential backoff;
//! non-transient ones fail immediately. At most one request per cache key is
//! in flight at a time — concurrent callers for the same key wait for the
//! first result instead of duplicating the fetch.

pub mod cache;
pub mod memory;

pub use cache::ContentCache;
pub use memory::{MemoryGate, MemoryProbe, ProcMeminfoProbe};

use crate::config::{RunConfig, RETRY_BACKOFF_MS};
use crate::error::FetchError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// What to fetch: an archived `(original_url, timestamp)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTarget {
    pub url: String,
    pub timestamp: String,
}

impl FetchTarget {
    pub fn new(url: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Deterministic cache key: identical targets map to the same key on
    /// every platform and process, which is what makes re-runs resumable.
    /// Keyed by `(timestamp, url)` so identical resources fetched for
    /// different capture timestamps still share an entry per timestamp.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.as_bytes());
        hasher.update(b":");
        hasher.update(self.url.as_bytes());
        hex_string(&hasher.finalize())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

type SharedResult = Option<Result<Arc<Vec<u8>>, FetchError>>;

struct HostState {
    slots: Semaphore,
    next_start: Mutex<Instant>,
}

/// The engine. Cheap to share behind an `Arc`; all interior state is
/// concurrency-safe.
pub struct FetchEngine {
    http: reqwest::Client,
    cfg: Arc<RunConfig>,
    cache: Arc<ContentCache>,
    gate: Arc<MemoryGate>,
    workers: Arc<Semaphore>,
    hosts: DashMap<String, Arc<HostState>>,
    inflight: DashMap<String, watch::Receiver<SharedResult>>,
    network_fetches: AtomicU64,
    cache_hits: AtomicU64,
}

impl FetchEngine {
    pub fn new(cfg: Arc<RunConfig>, cache: Arc<ContentCache>, gate: Arc<MemoryGate>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            workers: Arc::new(Semaphore::new(cfg.workers)),
            hosts: DashMap::new(),
            inflight: DashMap::new(),
            network_fetches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cfg,
            cache,
            gate,
        }
    }

    /// Retrieve the raw bytes of an archived target.
    pub async fn fetch(&self, target: &FetchTarget) -> Result<Arc<Vec<u8>>, FetchError> {
        let key = target.cache_key();

        loop {
            if let Some(bytes) = self.cache.get(&key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::new(bytes));
            }

            // Single-flight: the first caller for a key becomes the leader,
            // later callers subscribe to its result.
            enum Role {
                Leader(watch::Sender<SharedResult>),
                Follower(watch::Receiver<SharedResult>),
            }
            let role = match self.inflight.entry(key.clone()) {
                Entry::Occupied(occupied) => Role::Follower(occupied.get().clone()),
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    let result = self.fetch_uncached(target, &key).await;
                    let _ = tx.send(Some(result.clone()));
                    self.inflight.remove(&key);
                    return result;
                }
                Role::Follower(mut rx) => {
                    let settled = loop {
                        let current = rx.borrow().clone();
                        if let Some(result) = current {
                            break Some(result);
                        }
                        if rx.changed().await.is_err() {
                            break rx.borrow().clone();
                        }
                    };
                    match settled {
                        Some(result) => return result,
                        // Leader vanished without publishing (cancelled).
                        // Clear the dead slot and take over next iteration.
                        None => {
                            self.inflight
                                .remove_if(&key, |_, rx| rx.has_changed().is_err());
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Total requests that actually hit the network.
    pub fn network_fetch_count(&self) -> u64 {
        self.network_fetches.load(Ordering::Relaxed)
    }

    /// Total requests answered from the cache.
    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Peak memory usage observed by the gate during this run.
    pub fn peak_memory_percent(&self) -> f32 {
        self.gate.peak_percent()
    }

    async fn fetch_uncached(&self, target: &FetchTarget, key: &str) -> Result<Arc<Vec<u8>>, FetchError> {
        let url = self.cfg.replay_url(&target.timestamp, &target.url);
        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::InvalidTarget(url.clone()))?;

        // Admission order: memory gate, then the global worker budget, then
        // the per-host connection cap, then pacing.
        self.gate.admit().await;
        let _worker = self.workers.clone().acquire_owned().await.ok();

        let host_state = self
            .hosts
            .entry(host)
            .or_insert_with(|| {
                Arc::new(HostState {
                    slots: Semaphore::new(self.cfg.per_host),
                    next_start: Mutex::new(Instant::now()),
                })
            })
            .clone();
        let _slot = host_state.slots.acquire().await.ok();
        self.pace(&host_state).await;

        let mut last_error = String::new();
        for attempt in 0..self.cfg.max_attempts {
            if attempt > 0 {
                let delay = Duration::from_millis(RETRY_BACKOFF_MS * 2u64.pow(attempt - 1));
                debug!("retrying {url} in {delay:?} (attempt {})", attempt + 1);
                tokio::time::sleep(delay).await;
            }

            self.network_fetches.fetch_add(1, Ordering::Relaxed);
            let response = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status >= 500 || status == 429 {
                last_error = format!("HTTP {status}");
                continue;
            }
            if !(200..300).contains(&status) {
                return Err(FetchError::Status {
                    url: url.clone(),
                    status,
                });
            }

            let bytes = match response.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    last_error = format!("body read failed: {e}");
                    continue;
                }
            };

            // Populate the cache even in no-cache mode; bypass only skips
            // reads of pre-existing entries.
            if let Err(e) = self.cache.put(key, &bytes) {
                debug!("cache write failed for {url}: {e:#}");
            }
            return Ok(Arc::new(bytes));
        }

        Err(FetchError::RetriesExhausted {
            url,
            attempts: self.cfg.max_attempts,
            last: last_error,
        })
    }

    /// Enforce the minimum delay between request starts to one host. Each
    /// caller claims the next start slot, so consecutive requests to the
    /// same host are at least `delay_ms` apart.
    async fn pace(&self, host: &HostState) {
        let delay = Duration::from_millis(self.cfg.delay_ms);
        let wait = {
            let mut next = host.next_start.lock().await;
            let now = Instant::now();
            let wait = next.saturating_duration_since(now);
            *next = now.max(*next) + delay;
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn cache_key_is_stable_and_distinct() {
        let a = FetchTarget::new("http://example.com/x.css", "20150101000000");
        let b = FetchTarget::new("http://example.com/x.css", "20150101000000");
        let c = FetchTarget::new("http://example.com/x.css", "20160101000000");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_eq!(a.cache_key().len(), 64);
        assert!(a.cache_key().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    fn engine_for(archive: &str, cache_dir: &Path) -> FetchEngine {
        let mut cfg = RunConfig::new("example.com");
        cfg.archive_base = archive.to_string();
        cfg.delay_ms = 0;
        let cache =
            Arc::new(ContentCache::open(cache_dir.to_path_buf(), 1 << 20, true).unwrap());
        FetchEngine::new(Arc::new(cfg), cache, Arc::new(MemoryGate::disabled()))
    }

    fn target() -> FetchTarget {
        FetchTarget::new("http://example.com/a.css", "20150101000000")
    }

    #[tokio::test]
    async fn transient_status_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server.uri(), dir.path());

        let bytes = engine.fetch(&target()).await.unwrap();
        assert_eq!(&bytes[..], &b"payload"[..]);
        assert_eq!(engine.network_fetch_count(), 2);
    }

    #[tokio::test]
    async fn non_transient_status_fails_without_retry() {
        // Nothing mounted: every request gets 404.
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server.uri(), dir.path());

        let err = engine.fetch(&target()).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err}");
        assert_eq!(engine.network_fetch_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_fetches_for_one_key_share_a_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"shared".to_vec())
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server.uri(), dir.path());

        let t = target();
        let (a, b, c) = tokio::join!(engine.fetch(&t), engine.fetch(&t), engine.fetch(&t));
        for result in [a, b, c] {
            assert_eq!(&result.unwrap()[..], &b"shared"[..]);
        }
        assert_eq!(engine.network_fetch_count(), 1);
    }
}
