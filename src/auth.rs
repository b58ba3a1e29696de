//! Request authentication.
//!
//! Bearer credentials are validated shape-first (cheap structural check
//! before any hashing or store traffic), then resolved through the
//! credential cache with a store fallback. Rejections carry a stable kind
//! tag and never echo the plaintext token or its digest.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::{CacheOptions, Clock, SystemClock, TtlCache};
use crate::error::RpcCode;
use crate::hashing::KeyHasher;
use crate::store::{CredentialStore, StoreError};

pub const API_KEY_PREFIX: &str = "scrn_";
pub const API_KEY_SUFFIX_LEN: usize = 32;
pub const API_KEY_LEN: usize = API_KEY_PREFIX.len() + API_KEY_SUFFIX_LEN;

const CREDENTIAL_CACHE_CAPACITY: usize = 1000;
const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(300);

const KEY_FORMAT_REASON: &str = "expected scrn_ followed by 32 alphanumeric characters";
const KEY_UNKNOWN_REASON: &str = "no credential matches the supplied key";

/// Authenticated identity attached to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub api_key_id: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("authorization header must be 'Bearer <key>'")]
    InvalidHeaderFormat,
    #[error("invalid api key: {reason}")]
    InvalidApiKey { reason: &'static str },
    #[error("api key is expired")]
    ExpiredApiKey,
    #[error("api key has been revoked")]
    RevokedApiKey,
    #[error("credential lookup failed: {0}")]
    Database(#[source] StoreError),
    #[error("authentication failed: {0}")]
    Unknown(String),
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "MISSING_HEADER",
            AuthError::InvalidHeaderFormat => "INVALID_HEADER_FORMAT",
            AuthError::InvalidApiKey { .. } => "INVALID_API_KEY",
            AuthError::ExpiredApiKey => "EXPIRED_API_KEY",
            AuthError::RevokedApiKey => "REVOKED_API_KEY",
            AuthError::Database(_) => "DATABASE_ERROR",
            AuthError::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn code(&self) -> RpcCode {
        match self {
            AuthError::Database(_) | AuthError::Unknown(_) => RpcCode::Internal,
            _ => RpcCode::Unauthenticated,
        }
    }
}

/// Cached view of an authenticated credential, keyed by digest. The cache
/// TTL bounds staleness independently of the credential's own expiry, which
/// the validity predicate re-checks on every hit.
#[derive(Clone, Debug)]
pub struct CachedCredential {
    pub id: String,
    pub expires_at: i64,
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    hasher: KeyHasher,
    cache: Mutex<TtlCache<String, CachedCredential>>,
    clock: Box<dyn Clock>,
    /// Operations that skip authentication entirely. Empty in production;
    /// used only for unauthenticated bootstrap surfaces.
    bypass: HashSet<String>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, hasher: KeyHasher) -> Self {
        Self::with_clock(store, hasher, Box::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        hasher: KeyHasher,
        clock: Box<dyn Clock>,
    ) -> Self {
        let cache = TtlCache::new(CacheOptions {
            max_entries: CREDENTIAL_CACHE_CAPACITY,
            ttl: Some(CREDENTIAL_CACHE_TTL),
        })
        .with_validity(|credential: &CachedCredential, now_ms| {
            (now_ms / 1000) as i64 <= credential.expires_at
        });
        Self {
            store,
            hasher,
            cache: Mutex::new(cache),
            clock,
            bypass: HashSet::new(),
        }
    }

    pub fn with_bypass(mut self, operations: impl IntoIterator<Item = String>) -> Self {
        self.bypass.extend(operations);
        self
    }

    /// Resolves the caller for `operation`. `Ok(None)` only for bypassed
    /// operations; otherwise a rejected request maps to one terminal
    /// [`AuthError`].
    pub async fn authenticate(
        &self,
        operation: &str,
        authorization: Option<&str>,
    ) -> Result<Option<Principal>, AuthError> {
        if self.bypass.contains(operation) {
            return Ok(None);
        }

        let header = authorization.ok_or(AuthError::MissingHeader)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidHeaderFormat)?;
        if !is_well_formed_key(token) {
            return Err(AuthError::InvalidApiKey {
                reason: KEY_FORMAT_REASON,
            });
        }

        let digest = self.hasher.hash(token);
        let now_ms = self.clock.now_epoch_millis();

        if let Some(cached) = self.cache.lock().await.get(&digest, now_ms) {
            return Ok(Some(Principal {
                api_key_id: cached.id,
            }));
        }

        let record = self
            .store
            .credential_by_hash(&digest)
            .await
            .map_err(AuthError::Database)?;
        let Some(record) = record else {
            return Err(AuthError::InvalidApiKey {
                reason: KEY_UNKNOWN_REASON,
            });
        };
        if record.revoked {
            return Err(AuthError::RevokedApiKey);
        }
        if (now_ms / 1000) as i64 > record.expires_at {
            return Err(AuthError::ExpiredApiKey);
        }

        self.cache.lock().await.insert(
            digest,
            CachedCredential {
                id: record.id.clone(),
                expires_at: record.expires_at,
            },
            now_ms,
        );
        Ok(Some(Principal {
            api_key_id: record.id,
        }))
    }
}

fn is_well_formed_key(token: &str) -> bool {
    token.len() == API_KEY_LEN
        && token.starts_with(API_KEY_PREFIX)
        && token[API_KEY_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::CredentialRecord;

    struct FakeClock(AtomicU64);

    impl Clock for FakeClock {
        fn now_epoch_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeCredentialStore {
        records: Vec<CredentialRecord>,
        queries: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialStore for FakeCredentialStore {
        async fn credential_by_hash(
            &self,
            key_hash: &str,
        ) -> Result<Option<CredentialRecord>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Query("connection refused".to_string()));
            }
            Ok(self
                .records
                .iter()
                .find(|record| record.key_hash == key_hash)
                .cloned())
        }
    }

    const KEY: &str = "scrn_abcdefghijklmnopqrstuvwxyz012345";

    fn hasher() -> KeyHasher {
        KeyHasher::new("test-secret").expect("hasher")
    }

    fn seeded_store(expires_at: i64, revoked: bool) -> Arc<FakeCredentialStore> {
        Arc::new(FakeCredentialStore {
            records: vec![CredentialRecord {
                id: "key-1".to_string(),
                key_hash: hasher().hash(KEY),
                expires_at,
                revoked,
            }],
            queries: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn authenticator(store: Arc<FakeCredentialStore>, now_ms: u64) -> Authenticator {
        Authenticator::with_clock(
            store,
            hasher(),
            Box::new(FakeClock(AtomicU64::new(now_ms))),
        )
    }

    #[tokio::test]
    async fn rejection_ordering_matches_the_pipeline() {
        let auth = authenticator(seeded_store(2_000, false), 1_000_000);

        let err = auth.authenticate("events.submit", None).await.unwrap_err();
        assert_eq!(err.kind(), "MISSING_HEADER");

        let err = auth
            .authenticate("events.submit", Some("Token abc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_HEADER_FORMAT");

        let err = auth
            .authenticate(
                "events.submit",
                Some("Bearer xxxx_abcdefghijklmnopqrstuvwxyz012345"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_API_KEY");

        let err = auth
            .authenticate("events.submit", Some("Bearer scrn_short"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_API_KEY");

        let err = auth
            .authenticate(
                "events.submit",
                Some("Bearer scrn_00000000000000000000000000000000"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_API_KEY");
    }

    #[tokio::test]
    async fn valid_key_attaches_principal_and_populates_cache() {
        let store = seeded_store(2_000, false);
        let auth = authenticator(Arc::clone(&store), 1_000_000);

        let header = format!("Bearer {KEY}");
        let principal = auth
            .authenticate("events.submit", Some(&header))
            .await
            .expect("authenticated")
            .expect("principal");
        assert_eq!(principal.api_key_id, "key-1");

        auth.authenticate("events.submit", Some(&header))
            .await
            .expect("authenticated")
            .expect("principal");
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_and_expired_keys_are_rejected() {
        let auth = authenticator(seeded_store(2_000, true), 1_000_000);
        let header = format!("Bearer {KEY}");
        let err = auth
            .authenticate("events.submit", Some(&header))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "REVOKED_API_KEY");

        let auth = authenticator(seeded_store(500, false), 1_000_000);
        let err = auth
            .authenticate("events.submit", Some(&header))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EXPIRED_API_KEY");
    }

    #[tokio::test]
    async fn store_failure_is_a_database_error() {
        let store = Arc::new(FakeCredentialStore {
            records: Vec::new(),
            queries: AtomicUsize::new(0),
            fail: true,
        });
        let auth = authenticator(store, 1_000_000);
        let header = format!("Bearer {KEY}");
        let err = auth
            .authenticate("events.submit", Some(&header))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DATABASE_ERROR");
        assert_eq!(err.code(), RpcCode::Internal);
    }

    #[tokio::test]
    async fn bypassed_operation_skips_authentication() {
        let auth = authenticator(seeded_store(2_000, false), 1_000_000)
            .with_bypass(["healthz".to_string()]);
        let outcome = auth.authenticate("healthz", None).await.expect("bypassed");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn cached_entry_is_revalidated_against_credential_expiry() {
        struct SharedClock(Arc<AtomicU64>);

        impl Clock for SharedClock {
            fn now_epoch_millis(&self) -> u64 {
                self.0.load(Ordering::SeqCst)
            }
        }

        // Credential expires at 1_100s, inside the 300s cache TTL window
        // that starts at 1_000s, so the validity predicate is what evicts.
        let store = seeded_store(1_100, false);
        let now = Arc::new(AtomicU64::new(1_000_000));
        let auth = Authenticator::with_clock(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            hasher(),
            Box::new(SharedClock(Arc::clone(&now))),
        );

        let header = format!("Bearer {KEY}");
        auth.authenticate("events.submit", Some(&header))
            .await
            .expect("authenticated");
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);

        now.store(1_150_000, Ordering::SeqCst);
        let err = auth
            .authenticate("events.submit", Some(&header))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EXPIRED_API_KEY");
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
    }
}
