pub mod auth;
pub mod batch;
pub mod cache;
pub mod checkout;
pub mod config;
mod error;
pub mod event;
pub mod hashing;
pub mod http;
pub mod pricing;
pub mod store;

pub use auth::{AuthError, Authenticator, Principal};
pub use batch::{BatchCoordinator, BatchOutcome};
pub use cache::{CacheOptions, Clock, SystemClock, TtlCache};
pub use checkout::{CheckoutClient, CheckoutError};
pub use config::{Config, ConfigError, LemonSqueezyConfig};
pub use error::{GatewayError, RpcCode};
pub use event::{
    BillingEvent, EventError, EventKind, EventPayload, EventValidator, RawEvent, new_event_uid,
};
pub use hashing::KeyHasher;
pub use http::{AppState, router};
pub use pricing::{TagResolver, dollars_to_cents};
pub use store::{
    CredentialRecord, CredentialStore, EventRow, PersistedEvent, SqliteStore, StoreError, TagStore,
};
