//! Billing-event model and wire-payload validation.
//!
//! Inbound payloads carry a numeric discriminant, a `userId`, and a oneof
//! style `data` wrapper selecting the concrete payload shape. Validation
//! normalizes that into a typed [`BillingEvent`] with the wrapper removed,
//! money in integer cents, and a construction-time UTC timestamp.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::{Clock, SystemClock};
use crate::error::RpcCode;
use crate::hashing::hex_encode;
use crate::pricing::{TagResolver, dollars_to_cents};
use crate::store::StoreError;

static USER_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("user id pattern")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SdkCall,
    AiTokenUsage,
    AddKey,
    Payment,
    RequestPayment,
    RequestSdkCall,
}

impl EventKind {
    pub fn from_wire(discriminant: u32) -> Option<Self> {
        match discriminant {
            1 => Some(EventKind::SdkCall),
            2 => Some(EventKind::AiTokenUsage),
            3 => Some(EventKind::AddKey),
            4 => Some(EventKind::Payment),
            5 => Some(EventKind::RequestPayment),
            6 => Some(EventKind::RequestSdkCall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SdkCall => "SDK_CALL",
            EventKind::AiTokenUsage => "AI_TOKEN_USAGE",
            EventKind::AddKey => "ADD_KEY",
            EventKind::Payment => "PAYMENT",
            EventKind::RequestPayment => "REQUEST_PAYMENT",
            EventKind::RequestSdkCall => "REQUEST_SDK_CALL",
        }
    }

    pub fn from_persisted(raw: &str) -> Option<Self> {
        match raw {
            "SDK_CALL" => Some(EventKind::SdkCall),
            "AI_TOKEN_USAGE" => Some(EventKind::AiTokenUsage),
            "ADD_KEY" => Some(EventKind::AddKey),
            "PAYMENT" => Some(EventKind::Payment),
            "REQUEST_PAYMENT" => Some(EventKind::RequestPayment),
            "REQUEST_SDK_CALL" => Some(EventKind::RequestSdkCall),
            _ => None,
        }
    }

    /// Key of the union wrapper inside the wire `data` object.
    fn selector(self) -> &'static str {
        match self {
            EventKind::SdkCall => "sdkCall",
            EventKind::AiTokenUsage => "aiTokenUsage",
            EventKind::AddKey => "addKey",
            EventKind::Payment => "payment",
            EventKind::RequestPayment => "requestPayment",
            EventKind::RequestSdkCall => "requestSdkCall",
        }
    }

    /// Kinds with a multi-row insert path in the batch coordinator.
    pub fn batchable(self) -> bool {
        matches!(self, EventKind::SdkCall | EventKind::AiTokenUsage)
    }
}

/// Untyped inbound event as it arrives from the transport.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Optional idempotency key; generated when absent.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkCallData {
    pub feature: String,
    pub debit_amount_cents: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiTokenUsageData {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyData {
    pub key_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentData {
    pub debit_amount_cents: i64,
}

/// Normalized event payload: closed sum, union wrapper removed. `AddKey`
/// is the key-management variant and carries no user.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    SdkCall { user_id: String, data: SdkCallData },
    AiTokenUsage { user_id: String, data: AiTokenUsageData },
    AddKey { data: AddKeyData },
    Payment { user_id: String, data: PaymentData },
    RequestPayment { user_id: String, data: PaymentData },
    RequestSdkCall { user_id: String, data: SdkCallData },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SdkCall { .. } => EventKind::SdkCall,
            EventPayload::AiTokenUsage { .. } => EventKind::AiTokenUsage,
            EventPayload::AddKey { .. } => EventKind::AddKey,
            EventPayload::Payment { .. } => EventKind::Payment,
            EventPayload::RequestPayment { .. } => EventKind::RequestPayment,
            EventPayload::RequestSdkCall { .. } => EventKind::RequestSdkCall,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            EventPayload::SdkCall { user_id, .. }
            | EventPayload::AiTokenUsage { user_id, .. }
            | EventPayload::Payment { user_id, .. }
            | EventPayload::RequestPayment { user_id, .. }
            | EventPayload::RequestSdkCall { user_id, .. } => Some(user_id),
            EventPayload::AddKey { .. } => None,
        }
    }

    /// Persistence shape of the variant payload (flattened, no selector).
    pub fn data_json(&self) -> Result<String, serde_json::Error> {
        match self {
            EventPayload::SdkCall { data, .. } | EventPayload::RequestSdkCall { data, .. } => {
                serde_json::to_string(data)
            }
            EventPayload::AiTokenUsage { data, .. } => serde_json::to_string(data),
            EventPayload::AddKey { data } => serde_json::to_string(data),
            EventPayload::Payment { data, .. } | EventPayload::RequestPayment { data, .. } => {
                serde_json::to_string(data)
            }
        }
    }
}

/// Validated, not-yet-persisted event. `reported_at` is assigned here at
/// construction and is never client supplied.
#[derive(Clone, Debug)]
pub struct BillingEvent {
    pub reported_at: OffsetDateTime,
    pub payload: EventPayload,
}

impl BillingEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            reported_at: OffsetDateTime::now_utc(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.payload.user_id()
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("validation failed: {issues}")]
    ValidationFailed { issues: String },
    #[error("unsupported event type: {discriminant}")]
    UnsupportedEventType { discriminant: u32 },
    #[error("userId must be a UUID-shaped identifier")]
    InvalidUserId,
    #[error("event data is missing or does not match the event type")]
    MissingData,
    #[error("tag lookup failed: {0}")]
    Pricing(#[source] StoreError),
}

impl EventError {
    pub fn kind(&self) -> &'static str {
        match self {
            EventError::ValidationFailed { .. } => "VALIDATION_FAILED",
            EventError::UnsupportedEventType { .. } => "UNSUPPORTED_EVENT_TYPE",
            EventError::InvalidUserId => "INVALID_USER_ID",
            EventError::MissingData => "MISSING_DATA",
            EventError::Pricing(_) => "UNKNOWN",
        }
    }

    pub fn code(&self) -> RpcCode {
        match self {
            EventError::Pricing(_) => RpcCode::Internal,
            _ => RpcCode::InvalidArgument,
        }
    }
}

/// Field-level issues are aggregated into a single message instead of
/// failing on the first violation.
#[derive(Default)]
struct Issues(Vec<String>);

impl Issues {
    fn push(&mut self, path: impl std::fmt::Display, reason: impl std::fmt::Display) {
        self.0.push(format!("{path}: {reason}"));
    }

    fn into_error(self) -> Option<EventError> {
        if self.0.is_empty() {
            None
        } else {
            Some(EventError::ValidationFailed {
                issues: self.0.join("; "),
            })
        }
    }
}

pub struct EventValidator {
    tags: TagResolver,
}

impl EventValidator {
    pub fn new(tags: TagResolver) -> Self {
        Self { tags }
    }

    pub async fn validate(&self, raw: &RawEvent) -> Result<BillingEvent, EventError> {
        let kind = EventKind::from_wire(raw.kind).ok_or(EventError::UnsupportedEventType {
            discriminant: raw.kind,
        })?;

        let user_id = if kind == EventKind::AddKey {
            None
        } else {
            let id = raw.user_id.as_deref().ok_or(EventError::InvalidUserId)?;
            if !USER_ID_PATTERN.is_match(id) {
                return Err(EventError::InvalidUserId);
            }
            Some(id.to_string())
        };

        let data = raw.data.as_ref().ok_or(EventError::MissingData)?;
        let selected = data
            .get(kind.selector())
            .and_then(Value::as_object)
            .ok_or(EventError::MissingData)?;

        let mut issues = Issues::default();
        let path = format!("data.{}", kind.selector());

        let payload = match kind {
            EventKind::SdkCall | EventKind::RequestSdkCall => {
                let feature = required_string(selected, &path, "feature", &mut issues);
                let debit = self.debit_cents(selected, &path, &mut issues).await?;
                match (user_id, feature, debit) {
                    (Some(user_id), Some(feature), Some(debit_amount_cents)) => {
                        let data = SdkCallData {
                            feature,
                            debit_amount_cents,
                        };
                        Some(if kind == EventKind::SdkCall {
                            EventPayload::SdkCall { user_id, data }
                        } else {
                            EventPayload::RequestSdkCall { user_id, data }
                        })
                    }
                    _ => None,
                }
            }
            EventKind::AiTokenUsage => {
                let model = required_string(selected, &path, "model", &mut issues);
                let input_tokens = required_count(selected, &path, "inputTokens", &mut issues);
                let output_tokens = required_count(selected, &path, "outputTokens", &mut issues);
                match (user_id, model, input_tokens, output_tokens) {
                    (Some(user_id), Some(model), Some(input_tokens), Some(output_tokens)) => {
                        Some(EventPayload::AiTokenUsage {
                            user_id,
                            data: AiTokenUsageData {
                                model,
                                input_tokens,
                                output_tokens,
                            },
                        })
                    }
                    _ => None,
                }
            }
            EventKind::AddKey => required_string(selected, &path, "keyId", &mut issues)
                .map(|key_id| EventPayload::AddKey {
                    data: AddKeyData { key_id },
                }),
            EventKind::Payment | EventKind::RequestPayment => {
                let debit = self.debit_cents(selected, &path, &mut issues).await?;
                match (user_id, debit) {
                    (Some(user_id), Some(debit_amount_cents)) => {
                        let data = PaymentData { debit_amount_cents };
                        Some(if kind == EventKind::Payment {
                            EventPayload::Payment { user_id, data }
                        } else {
                            EventPayload::RequestPayment { user_id, data }
                        })
                    }
                    _ => None,
                }
            }
        };

        if let Some(error) = issues.into_error() {
            return Err(error);
        }
        let payload = payload.ok_or(EventError::MissingData)?;
        Ok(BillingEvent::new(payload))
    }

    /// A payload supplies exactly one of a direct dollar amount or a tag.
    /// Inline amounts are floored to cents; tag amounts are already cents.
    async fn debit_cents(
        &self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        issues: &mut Issues,
    ) -> Result<Option<i64>, EventError> {
        match (obj.get("debitAmount"), obj.get("tag")) {
            (Some(_), Some(_)) => {
                issues.push(
                    format!("{path}.debitAmount"),
                    "supply either debitAmount or tag, not both",
                );
                Ok(None)
            }
            (Some(value), None) => {
                let Some(dollars) = value.as_f64() else {
                    issues.push(format!("{path}.debitAmount"), "must be a number");
                    return Ok(None);
                };
                if !dollars.is_finite() {
                    issues.push(format!("{path}.debitAmount"), "must be a finite number");
                    return Ok(None);
                }
                if dollars < 0.0 {
                    issues.push(format!("{path}.debitAmount"), "must not be negative");
                    return Ok(None);
                }
                Ok(Some(dollars_to_cents(dollars)))
            }
            (None, Some(value)) => {
                let Some(tag) = value.as_str().filter(|tag| !tag.is_empty()) else {
                    issues.push(format!("{path}.tag"), "must be a non-empty string");
                    return Ok(None);
                };
                match self.tags.resolve(tag).await {
                    Ok(Some(cents)) => Ok(Some(cents)),
                    Ok(None) => {
                        issues.push(format!("{path}.tag"), format!("unknown tag \"{tag}\""));
                        Ok(None)
                    }
                    Err(err) => Err(EventError::Pricing(err)),
                }
            }
            (None, None) => {
                issues.push(
                    format!("{path}.debitAmount"),
                    "either debitAmount or tag is required",
                );
                Ok(None)
            }
        }
    }
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    path: &str,
    key: &str,
    issues: &mut Issues,
) -> Option<String> {
    match obj.get(key) {
        Some(value) => match value.as_str() {
            Some(raw) if !raw.is_empty() => Some(raw.to_string()),
            Some(_) => {
                issues.push(format!("{path}.{key}"), "must not be empty");
                None
            }
            None => {
                issues.push(format!("{path}.{key}"), "must be a string");
                None
            }
        },
        None => {
            issues.push(format!("{path}.{key}"), "is required");
            None
        }
    }
}

fn required_count(
    obj: &serde_json::Map<String, Value>,
    path: &str,
    key: &str,
    issues: &mut Issues,
) -> Option<u64> {
    match obj.get(key) {
        Some(value) => match value.as_u64() {
            Some(count) => Some(count),
            None => {
                issues.push(format!("{path}.{key}"), "must be a non-negative integer");
                None
            }
        },
        None => {
            issues.push(format!("{path}.{key}"), "is required");
            None
        }
    }
}

/// Idempotency key for an event row when the caller does not supply one.
pub fn new_event_uid() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = SystemClock.now_epoch_millis();
        return format!("evt_fallback_{ts_ms}");
    }
    format!("evt_{}", hex_encode(&bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::store::TagStore;

    struct FakeTagStore;

    #[async_trait]
    impl TagStore for FakeTagStore {
        async fn tag_amount(&self, tag: &str) -> Result<Option<i64>, StoreError> {
            Ok(match tag {
                "pro-call" => Some(250),
                _ => None,
            })
        }
    }

    fn validator() -> EventValidator {
        EventValidator::new(TagResolver::new(Arc::new(FakeTagStore)))
    }

    const USER: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

    fn raw(kind: u32, user_id: Option<&str>, data: Value) -> RawEvent {
        RawEvent {
            kind,
            user_id: user_id.map(str::to_string),
            event_id: None,
            data: Some(data),
        }
    }

    #[tokio::test]
    async fn sdk_call_with_inline_amount_floors_to_cents() {
        let event = validator()
            .validate(&raw(
                1,
                Some(USER),
                json!({"sdkCall": {"feature": "search", "debitAmount": 123.456}}),
            ))
            .await
            .expect("valid event");
        assert_eq!(event.kind(), EventKind::SdkCall);
        assert_eq!(event.user_id(), Some(USER));
        match &event.payload {
            EventPayload::SdkCall { data, .. } => {
                assert_eq!(data.feature, "search");
                assert_eq!(data.debit_amount_cents, 12345);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sdk_call_with_tag_uses_table_cents_without_rescaling() {
        let event = validator()
            .validate(&raw(
                6,
                Some(USER),
                json!({"requestSdkCall": {"feature": "search", "tag": "pro-call"}}),
            ))
            .await
            .expect("valid event");
        match &event.payload {
            EventPayload::RequestSdkCall { data, .. } => {
                assert_eq!(data.debit_amount_cents, 250);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tag_names_the_tag() {
        let err = validator()
            .validate(&raw(
                1,
                Some(USER),
                json!({"sdkCall": {"feature": "search", "tag": "nope"}}),
            ))
            .await
            .expect_err("unknown tag");
        match err {
            EventError::ValidationFailed { issues } => {
                assert!(issues.contains("unknown tag \"nope\""), "{issues}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn field_issues_are_aggregated() {
        let err = validator()
            .validate(&raw(
                2,
                Some(USER),
                json!({"aiTokenUsage": {"model": "", "inputTokens": -3, "outputTokens": 1.5}}),
            ))
            .await
            .expect_err("invalid payload");
        match err {
            EventError::ValidationFailed { issues } => {
                assert!(issues.contains("data.aiTokenUsage.model"), "{issues}");
                assert!(issues.contains("data.aiTokenUsage.inputTokens"), "{issues}");
                assert!(issues.contains("data.aiTokenUsage.outputTokens"), "{issues}");
                assert_eq!(issues.matches("; ").count(), 2, "{issues}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_amount_and_tag_is_rejected() {
        let err = validator()
            .validate(&raw(
                4,
                Some(USER),
                json!({"payment": {"debitAmount": 1.0, "tag": "pro-call"}}),
            ))
            .await
            .expect_err("ambiguous debit");
        assert_eq!(err.kind(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn unknown_discriminant_is_unsupported() {
        let err = validator()
            .validate(&raw(99, Some(USER), json!({})))
            .await
            .expect_err("unsupported");
        assert_eq!(err.kind(), "UNSUPPORTED_EVENT_TYPE");
    }

    #[tokio::test]
    async fn malformed_user_id_is_rejected() {
        let err = validator()
            .validate(&raw(
                1,
                Some("not-a-uuid"),
                json!({"sdkCall": {"feature": "search", "debitAmount": 1.0}}),
            ))
            .await
            .expect_err("bad user id");
        assert_eq!(err.kind(), "INVALID_USER_ID");
    }

    #[tokio::test]
    async fn missing_or_mismatched_data_wrapper_is_rejected() {
        let err = validator()
            .validate(&RawEvent {
                kind: 1,
                user_id: Some(USER.to_string()),
                event_id: None,
                data: None,
            })
            .await
            .expect_err("no data");
        assert_eq!(err.kind(), "MISSING_DATA");

        let err = validator()
            .validate(&raw(1, Some(USER), json!({"payment": {"debitAmount": 1.0}})))
            .await
            .expect_err("wrong selector");
        assert_eq!(err.kind(), "MISSING_DATA");
    }

    #[tokio::test]
    async fn add_key_needs_no_user_id() {
        let event = validator()
            .validate(&raw(3, None, json!({"addKey": {"keyId": "key-1"}})))
            .await
            .expect("add key");
        assert_eq!(event.kind(), EventKind::AddKey);
        assert_eq!(event.user_id(), None);
    }

    #[test]
    fn persisted_data_round_trips() {
        let payload = EventPayload::SdkCall {
            user_id: USER.to_string(),
            data: SdkCallData {
                feature: "search".to_string(),
                debit_amount_cents: 12345,
            },
        };
        let raw = payload.data_json().expect("json");
        let decoded: SdkCallData = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded.feature, "search");
        assert_eq!(decoded.debit_amount_cents, 12345);
    }

    #[test]
    fn event_uids_are_unique() {
        assert_ne!(new_event_uid(), new_event_uid());
    }
}
