use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use super::state_file::{self, SnapshotWriter, StateFileError};

static KEY_FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    #[serde(with = "state_file::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "state_file::timestamp")]
    pub expires_at: OffsetDateTime,
}

impl std::fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("key", &redact_key(&self.key))
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl ApiKeyRecord {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum KeyValidationError {
    #[error("api key not found")]
    NotFound,
    #[error("api key expired at {expires_at}")]
    Expired { expires_at: OffsetDateTime },
}

#[derive(Default)]
struct KeySet {
    records: HashMap<String, ApiKeyRecord>,
    generation: u64,
}

/// API keys, each valid from creation until its expiry instant.
#[derive(Default)]
pub struct CredentialStore {
    keys: RwLock<KeySet>,
    writer: Option<SnapshotWriter>,
}

impl CredentialStore {
    /// Persists the full key set to `path` after every mutation, starting from whatever the
    /// file already holds.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match state_file::load_json::<Vec<ApiKeyRecord>>(&path) {
            Ok(records) => records.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable key file");
                Vec::new()
            }
        };

        let store = Self {
            keys: RwLock::new(KeySet::default()),
            writer: Some(SnapshotWriter::new(path)),
        };
        {
            let mut keys = store.keys.write().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                if record.expires_at <= record.created_at {
                    tracing::warn!(key_id = %redact_key(&record.key), "skipping key that expires before it was created");
                    continue;
                }
                keys.records.insert(record.key.clone(), record);
            }
        }
        store
    }

    pub fn issue(&self, ttl_days: u32, now: OffsetDateTime) -> Result<ApiKeyRecord, StateFileError> {
        let record = ApiKeyRecord {
            key: generate_key_token(),
            created_at: now,
            expires_at: now + Duration::days(i64::from(ttl_days.max(1))),
        };
        self.insert(record.clone())?;
        tracing::info!(key_id = %redact_key(&record.key), ttl_days, "issued api key");
        Ok(record)
    }

    /// Adds a record as-is, replacing any record with the same token.
    pub fn insert(&self, record: ApiKeyRecord) -> Result<(), StateFileError> {
        let snapshot = {
            let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            keys.records.insert(record.key.clone(), record);
            keys.generation += 1;
            (keys.generation, sorted(&keys.records))
        };
        self.persist(snapshot)
    }

    pub fn validate(&self, key: &str, now: OffsetDateTime) -> Result<ApiKeyRecord, KeyValidationError> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let record = keys.records.get(key).ok_or(KeyValidationError::NotFound)?;
        if record.is_expired(now) {
            return Err(KeyValidationError::Expired {
                expires_at: record.expires_at,
            });
        }
        Ok(record.clone())
    }

    pub fn revoke(&self, key: &str) -> Result<bool, StateFileError> {
        let snapshot = {
            let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            if keys.records.remove(key).is_none() {
                return Ok(false);
            }
            keys.generation += 1;
            (keys.generation, sorted(&keys.records))
        };
        self.persist(snapshot)?;
        tracing::info!(key_id = %redact_key(key), "revoked api key");
        Ok(true)
    }

    /// Every record, oldest first.
    pub fn list(&self) -> Vec<ApiKeyRecord> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        sorted(&keys.records)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, (generation, records): (u64, Vec<ApiKeyRecord>)) -> Result<(), StateFileError> {
        match self.writer.as_ref() {
            Some(writer) => writer.write(generation, &records),
            None => Ok(()),
        }
    }
}

fn sorted(records: &HashMap<String, ApiKeyRecord>) -> Vec<ApiKeyRecord> {
    let mut out: Vec<ApiKeyRecord> = records.values().cloned().collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
    out
}

/// Short, log-safe form of a key.
pub fn redact_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{prefix}…")
}

fn generate_key_token() -> String {
    let mut bytes = [0u8; 32];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let seq = KEY_FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("sk_fallback_{ts_ms}_{seq}");
    }
    format!("sk-{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
