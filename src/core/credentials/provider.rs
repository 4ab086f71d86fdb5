//! Ephemeral credential issuance, caching and refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::credential::{Credential, TokenResponse};
use super::error::{CredentialError, CredentialResult};
use crate::core::backoff::BackoffPolicy;

/// Path of the issuance endpoint relative to the token service base URL.
pub const EPHEMERAL_PATH: &str = "/realtime/ephemeral";

/// Default margin before expiry inside which a cached credential is not used.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Default request timeout against the token service.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Credential Source
// =============================================================================

/// Anything that can hand out realtime credentials.
///
/// Implementations must be safe for concurrent use: the coordinator shares one
/// source between both directions and the failover path.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Cached credential while it is valid with margin, otherwise a refresh.
    async fn get_credential(&self) -> CredentialResult<Credential>;

    /// Mint a new credential and cache it. Concurrent callers share one request.
    async fn refresh(&self) -> CredentialResult<Credential>;

    /// Mint a credential that is neither cached nor shared with other callers.
    async fn issue(&self) -> CredentialResult<Credential>;

    /// Zero and drop the cached credential.
    async fn clear(&self);
}

// =============================================================================
// HTTP Provider
// =============================================================================

/// Settings for [`CredentialProvider`].
#[derive(Clone)]
pub struct CredentialProviderConfig {
    /// Base URL of the token service (e.g. `https://tokens.example.com`).
    pub endpoint: String,
    /// Optional app key sent as a bearer token to the token service.
    pub app_key: Option<Zeroizing<String>>,
    pub request_timeout: Duration,
    pub refresh_margin: Duration,
    pub backoff: BackoffPolicy,
}

impl CredentialProviderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Full issuance URL.
    pub fn issue_url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), EPHEMERAL_PATH)
    }
}

impl std::fmt::Debug for CredentialProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProviderConfig")
            .field("endpoint", &self.endpoint)
            .field("app_key", &self.app_key.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout", &self.request_timeout)
            .field("refresh_margin", &self.refresh_margin)
            .field("backoff", &self.backoff)
            .finish()
    }
}

type RefreshFuture = Shared<BoxFuture<'static, CredentialResult<Credential>>>;

struct ProviderInner {
    config: CredentialProviderConfig,
    http_client: Client,
    cached: Mutex<Option<Credential>>,
    in_flight: Mutex<Option<RefreshFuture>>,
    /// Bumped by `clear`; a refresh started under an older generation must
    /// not repopulate the cache.
    generation: AtomicU64,
}

/// Token-service client with a cached credential and deduplicated refresh.
///
/// Cheap to clone; clones share the cache and the in-flight refresh.
#[derive(Clone)]
pub struct CredentialProvider {
    inner: Arc<ProviderInner>,
}

impl CredentialProvider {
    pub fn new(config: CredentialProviderConfig) -> CredentialResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CredentialError::unknown(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(ProviderInner {
                config,
                http_client,
                cached: Mutex::new(None),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &CredentialProviderConfig {
        &self.inner.config
    }

    /// Whether a credential is cached and still valid with margin.
    pub fn has_valid_credential(&self) -> bool {
        self.inner
            .cached
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_valid_with_margin(self.inner.config.refresh_margin))
    }
}

impl ProviderInner {
    /// One POST to the issuance endpoint.
    async fn mint(&self) -> CredentialResult<Credential> {
        let url = self.config.issue_url();
        debug!("Requesting ephemeral credential from {}", url);

        let mut request = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({}));
        if let Some(key) = &self.config.app_key {
            request = request.bearer_auth(key.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::from_status(
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CredentialError::network(format!("Failed to read response: {e}")))?;
        TokenResponse::parse(&body)
    }

    /// Mint with local retries for retryable failures.
    async fn mint_with_retry(&self) -> CredentialResult<Credential> {
        let backoff = &self.config.backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.mint().await {
                Ok(credential) => {
                    info!(
                        "Issued {} credential, expires at {}",
                        credential.token_type(),
                        credential.expires_at()
                    );
                    return Ok(credential);
                }
                Err(e) if e.is_retryable() && backoff.should_retry(attempt) => {
                    let cap = Duration::from_millis(backoff.max_delay_ms);
                    let delay = e
                        .retry_after
                        .map(|server_delay| server_delay.min(cap))
                        .unwrap_or_else(|| backoff.delay_for(attempt));
                    warn!(
                        "Credential request failed (attempt {}): {}. Retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("Credential request failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl CredentialSource for CredentialProvider {
    async fn get_credential(&self) -> CredentialResult<Credential> {
        {
            let cached = self.inner.cached.lock();
            if let Some(credential) = cached.as_ref()
                && credential.is_valid_with_margin(self.inner.config.refresh_margin)
            {
                return Ok(credential.clone());
            }
        }
        debug!("Cached credential missing or inside refresh margin");
        self.refresh().await
    }

    async fn refresh(&self) -> CredentialResult<Credential> {
        let refresh = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight credential refresh");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let generation = inner.generation.load(Ordering::SeqCst);
                    let fut: RefreshFuture = async move {
                        let result = inner.mint_with_retry().await;
                        // Hold the slot lock so clear() cannot interleave
                        let mut slot = inner.in_flight.lock();
                        if inner.generation.load(Ordering::SeqCst) != generation {
                            debug!("Credential refresh finished after clear, discarding");
                            return result;
                        }
                        if let Ok(credential) = &result {
                            *inner.cached.lock() = Some(credential.clone());
                        }
                        *slot = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        refresh.await
    }

    async fn issue(&self) -> CredentialResult<Credential> {
        self.inner.mint_with_retry().await
    }

    async fn clear(&self) {
        {
            let mut slot = self.inner.in_flight.lock();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            slot.take();
        }
        // Dropping the credential zeroizes its token.
        self.inner.cached.lock().take();
        debug!("Cleared cached credential");
    }
}
