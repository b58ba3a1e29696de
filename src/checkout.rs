//! Lemon Squeezy checkout-link client.
//!
//! Configuration is validated at construction time, so a gateway that never
//! sells anything can run without payment credentials.

use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::LemonSqueezyConfig;
use crate::error::RpcCode;

const DEFAULT_BASE_URL: &str = "https://api.lemonsqueezy.com";

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("LEMON_SQUEEZY_API_KEY is not set")]
    MissingApiKey,
    #[error("LEMON_SQUEEZY_STORE_ID is not set")]
    MissingStoreId,
    #[error("LEMON_SQUEEZY_VARIANT_ID is not set")]
    MissingVariantId,
    #[error("lemon squeezy returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed checkout response: {0}")]
    InvalidResponse(String),
    #[error("checkout request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl CheckoutError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "MISSING_API_KEY",
            Self::MissingStoreId => "MISSING_STORE_ID",
            Self::MissingVariantId => "MISSING_VARIANT_ID",
            Self::Api { .. } => "LEMON_SQUEEZY_API_ERROR",
            Self::InvalidResponse(_) => "INVALID_CHECKOUT_RESPONSE",
            Self::Request(_) => "CHECKOUT_CREATION_FAILED",
        }
    }

    pub fn code(&self) -> RpcCode {
        match self {
            Self::MissingApiKey | Self::MissingStoreId | Self::MissingVariantId => {
                RpcCode::FailedPrecondition
            }
            Self::Api { .. } | Self::InvalidResponse(_) | Self::Request(_) => RpcCode::Internal,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    store_id: String,
    variant_id: String,
}

impl std::fmt::Debug for CheckoutClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("store_id", &self.store_id)
            .field("variant_id", &self.variant_id)
            .finish()
    }
}

impl CheckoutClient {
    pub fn new(config: &LemonSqueezyConfig) -> Result<Self, CheckoutError> {
        let api_key = config.api_key.clone().ok_or(CheckoutError::MissingApiKey)?;
        let store_id = config
            .store_id
            .clone()
            .ok_or(CheckoutError::MissingStoreId)?;
        let variant_id = config
            .variant_id
            .clone()
            .ok_or(CheckoutError::MissingVariantId)?;

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client build should not fail");

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            store_id,
            variant_id,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn checkouts_url(&self) -> String {
        format!("{}/v1/checkouts", self.base_url.trim_end_matches('/'))
    }

    /// Creates a one-off checkout priced at `price_cents` and tagged with the
    /// buyer's user id, returning the hosted checkout URL.
    pub async fn create_checkout(
        &self,
        user_id: &str,
        price_cents: i64,
    ) -> Result<String, CheckoutError> {
        let body = json!({
            "data": {
                "type": "checkouts",
                "attributes": {
                    "custom_price": price_cents,
                    "checkout_data": {
                        "custom": { "user_id": user_id }
                    }
                },
                "relationships": {
                    "store": {
                        "data": { "type": "stores", "id": self.store_id }
                    },
                    "variant": {
                        "data": { "type": "variants", "id": self.variant_id }
                    }
                }
            }
        });

        let response = self
            .http
            .post(self.checkouts_url())
            .bearer_auth(&self.api_key)
            .header("accept", "application/vnd.api+json")
            .header("content-type", "application/vnd.api+json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CheckoutError::Api { status, body: text });
        }

        let parsed = response.json::<Value>().await?;
        let url = parsed
            .pointer("/data/attributes/url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CheckoutError::InvalidResponse("missing data.attributes.url".to_string())
            })?;
        if reqwest::Url::parse(url).is_err() {
            return Err(CheckoutError::InvalidResponse(format!(
                "checkout url does not parse: {url}"
            )));
        }
        Ok(url.to_string())
    }
}
