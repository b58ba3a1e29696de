//! Streaming ingestion: validate events independently, group by kind, and
//! amortize the transaction cost with multi-row inserts where a batch path
//! exists.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::auth::Principal;
use crate::event::{BillingEvent, EventKind, EventValidator, RawEvent, new_event_uid};
use crate::store::{EventRow, SqliteStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub received: usize,
    /// May be less than `received`: invalid events are dropped and
    /// duplicates are absorbed.
    pub persisted: usize,
}

pub struct BatchCoordinator {
    validator: Arc<EventValidator>,
    store: Arc<SqliteStore>,
}

impl BatchCoordinator {
    pub fn new(validator: Arc<EventValidator>, store: Arc<SqliteStore>) -> Self {
        Self { validator, store }
    }

    /// One failed event never fails the stream; it is logged and dropped.
    pub async fn ingest(
        &self,
        principal: Option<&Principal>,
        raw_events: Vec<RawEvent>,
    ) -> BatchOutcome {
        let received = raw_events.len();
        let api_key_id = principal.map(|p| p.api_key_id.as_str());

        let mut groups: HashMap<EventKind, Vec<(BillingEvent, String)>> = HashMap::new();
        for raw in &raw_events {
            match self.validator.validate(raw).await {
                Ok(event) => {
                    let uid = raw.event_id.clone().unwrap_or_else(new_event_uid);
                    groups.entry(event.kind()).or_default().push((event, uid));
                }
                Err(err) => {
                    tracing::warn!(
                        discriminant = raw.kind,
                        kind = err.kind(),
                        error = %err,
                        "dropping invalid event in batch"
                    );
                }
            }
        }

        let mut persisted = 0usize;
        for (kind, group) in groups {
            if kind.batchable() {
                let mut rows = Vec::with_capacity(group.len());
                for (event, uid) in &group {
                    match EventRow::prepare(event, api_key_id, uid) {
                        Ok(row) => rows.push(row),
                        Err(err) => {
                            tracing::warn!(
                                event_kind = kind.as_str(),
                                error = %err,
                                "dropping batch member that failed to serialize"
                            );
                        }
                    }
                }
                match self.store.insert_events(rows).await {
                    Ok(count) => persisted += count,
                    Err(err) => {
                        tracing::warn!(
                            event_kind = kind.as_str(),
                            kind = err.kind(),
                            error = %err,
                            "batch insert failed; dropping group"
                        );
                    }
                }
            } else {
                for (event, uid) in &group {
                    match self.store.insert_event(event, api_key_id, uid).await {
                        Ok(Some(_)) => persisted += 1,
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(
                                event_kind = kind.as_str(),
                                kind = err.kind(),
                                error = %err,
                                "event insert failed; dropping event"
                            );
                        }
                    }
                }
            }
        }

        BatchOutcome {
            received,
            persisted,
        }
    }
}
