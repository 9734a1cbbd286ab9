//! Idempotency ledger for billed external calls.
//!
//! A key is the SHA-256 of the canonical JSON of `(item id, stage, inputs)`.
//! The first successful result stored under a key is returned to every
//! later caller with the same key; the compute closure is not invoked
//! again. Failed computations store nothing, so a retry calls out again.
//!
//! Concurrent callers in one process serialise on a per-key async mutex.
//! Across processes, the primary key on `idempotency_records` decides the
//! winner and losers adopt the stored row.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::ledger_repo::{self, LedgerRow};
use crate::db::{Database, DatabaseError};
use crate::pipeline::stage::StageId;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to encode idempotency inputs: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Stored result for key {key} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

/// Deterministic key for one external call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    digest: String,
    item_id: String,
    stage: StageId,
}

impl IdempotencyKey {
    /// Derives the key. `inputs` must contain only what the call's result
    /// depends on: no timestamps, no attempt counters.
    pub fn derive<I: Serialize>(
        item_id: &str,
        stage: StageId,
        inputs: &I,
    ) -> Result<Self, LedgerError> {
        let canonical = serde_json::json!({
            "item": item_id,
            "stage": stage.number(),
            "inputs": serde_json::to_value(inputs).map_err(LedgerError::Encode)?,
        });
        let mut text = String::new();
        write_canonical(&canonical, &mut text);
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        Ok(Self {
            digest,
            item_id: item_id.to_string(),
            stage,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.digest
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.digest)
    }
}

/// Writes `value` as JSON with object keys sorted at every level, so the
/// encoding does not depend on map insertion order.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A ledger result and whether this call produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerOutcome<T> {
    pub value: T,
    /// True when `compute` ran and its result was stored by this call.
    pub created: bool,
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    db: Database,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IdempotencyLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key_lock(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>, LedgerError> {
        let mut locks = self.locks.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        ))
    }

    fn release_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        if let Ok(mut locks) = self.locks.lock() {
            // Only the map holds it now: nobody is waiting on this key.
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }

    fn lookup<T: DeserializeOwned>(&self, key: &IdempotencyKey) -> Result<Option<T>, LedgerError> {
        match ledger_repo::find(&self.db, key.as_str())? {
            Some(row) => serde_json::from_str(&row.result)
                .map(Some)
                .map_err(|source| LedgerError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Returns the stored result for `key`, or runs `compute` and stores
    /// its result. Errors from `compute` are passed through unrecorded.
    pub async fn get_or_create<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        compute: F,
    ) -> Result<LedgerOutcome<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<LedgerError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lock = self.key_lock(key.as_str())?;
        let result = {
            let _guard = lock.lock().await;
            self.get_or_create_locked(key, compute).await
        };
        self.release_lock(key.as_str(), lock);
        result
    }

    async fn get_or_create_locked<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        compute: F,
    ) -> Result<LedgerOutcome<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<LedgerError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(key)? {
            tracing::debug!(key = %key, stage = key.stage.number(), "Ledger hit");
            return Ok(LedgerOutcome {
                value,
                created: false,
            });
        }

        let value = compute().await?;
        let encoded = serde_json::to_string(&value).map_err(LedgerError::Encode)?;
        let row = LedgerRow {
            key: key.as_str().to_string(),
            item_id: key.item_id.clone(),
            stage: i64::from(key.stage.number()),
            result: encoded,
            created_at: Utc::now().to_rfc3339(),
        };

        if ledger_repo::insert_if_absent(&self.db, &row).map_err(LedgerError::from)? {
            return Ok(LedgerOutcome {
                value,
                created: true,
            });
        }

        // Another process stored a result first; theirs is authoritative.
        tracing::warn!(key = %key, "Ledger insert lost a race; adopting stored result");
        match self.lookup(key)? {
            Some(stored) => Ok(LedgerOutcome {
                value: stored,
                created: false,
            }),
            None => Ok(LedgerOutcome {
                value,
                created: true,
            }),
        }
    }

    pub fn records_for_item(&self, item_id: &str) -> Result<u64, LedgerError> {
        Ok(ledger_repo::count_for_item(&self.db, item_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("ledger: {0}")]
        Ledger(#[from] LedgerError),
        #[error("upstream failed")]
        Upstream,
    }

    fn ledger() -> IdempotencyLedger {
        IdempotencyLedger::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = IdempotencyKey::derive("i1", StageId::Writer, &json!({"b": 1, "a": 2})).unwrap();
        let b = IdempotencyKey::derive("i1", StageId::Writer, &json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_key_changes_with_any_component() {
        let base = IdempotencyKey::derive("i1", StageId::Writer, &json!({"a": 1})).unwrap();
        let other_item = IdempotencyKey::derive("i2", StageId::Writer, &json!({"a": 1})).unwrap();
        let other_stage = IdempotencyKey::derive("i1", StageId::Qc, &json!({"a": 1})).unwrap();
        let other_input = IdempotencyKey::derive("i1", StageId::Writer, &json!({"a": 2})).unwrap();
        assert_ne!(base, other_item);
        assert_ne!(base, other_stage);
        assert_ne!(base, other_input);
    }

    #[tokio::test]
    async fn test_identical_inputs_call_once() {
        let ledger = ledger();
        let calls = AtomicUsize::new(0);
        let key = IdempotencyKey::derive("i1", StageId::Writer, &json!({"draft": 1})).unwrap();

        for _ in 0..3 {
            let outcome: LedgerOutcome<serde_json::Value> = ledger
                .get_or_create(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(json!({"script": "hello"}))
                })
                .await
                .unwrap();
            assert_eq!(outcome.value, json!({"script": "hello"}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.records_for_item("i1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_different_inputs_call_twice() {
        let ledger = ledger();
        let calls = AtomicUsize::new(0);
        for draft in [1, 2] {
            let key = IdempotencyKey::derive("i1", StageId::Writer, &json!({ "draft": draft }))
                .unwrap();
            let outcome = ledger
                .get_or_create(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(draft)
                })
                .await
                .unwrap();
            assert!(outcome.created);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded() {
        let ledger = ledger();
        let key = IdempotencyKey::derive("i1", StageId::Scout, &json!({})).unwrap();

        let first: Result<LedgerOutcome<u32>, TestError> = ledger
            .get_or_create(&key, || async { Err(TestError::Upstream) })
            .await;
        assert!(matches!(first, Err(TestError::Upstream)));

        let second = ledger
            .get_or_create(&key, || async { Ok::<_, TestError>(7u32) })
            .await
            .unwrap();
        assert!(second.created);
        assert_eq!(second.value, 7);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_call() {
        let ledger = ledger();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = IdempotencyKey::derive("i1", StageId::Analyst, &json!({"x": 1})).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .get_or_create(&key, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok::<_, TestError>(42u32)
                    })
                    .await
                    .map(|o| o.created)
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(created, 1);
    }
}
