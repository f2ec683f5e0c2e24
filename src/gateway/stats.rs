use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::state_file::{self, SnapshotWriter, StateFileError};

/// Usage counters for one key. `total_calls` never decreases while the record exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    pub total_calls: u64,
    #[serde(rename = "last_call", with = "state_file::timestamp::option", default)]
    pub last_call_at: Option<OffsetDateTime>,
    pub calls_today: u64,
    #[serde(rename = "today")]
    pub day_bucket: String,
}

impl CallStats {
    fn first(now: OffsetDateTime) -> Self {
        Self {
            total_calls: 0,
            last_call_at: None,
            calls_today: 0,
            day_bucket: state_file::day_bucket(now),
        }
    }

    fn record(&mut self, now: OffsetDateTime) {
        self.total_calls = self.total_calls.saturating_add(1);
        self.last_call_at = Some(now);

        let today = state_file::day_bucket(now);
        if self.day_bucket != today {
            self.day_bucket = today;
            self.calls_today = 1;
        } else {
            self.calls_today = self.calls_today.saturating_add(1);
        }
    }

    /// Calls counted for `now`'s day; a stale bucket counts as zero.
    pub fn calls_on(&self, now: OffsetDateTime) -> u64 {
        if self.day_bucket == state_file::day_bucket(now) {
            self.calls_today
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsSummary {
    #[serde(with = "state_file::timestamp")]
    pub export_time: OffsetDateTime,
    pub total_calls: u64,
    pub today_calls: u64,
    pub active_api_keys: usize,
    pub api_key_stats: BTreeMap<String, CallStats>,
}

#[derive(Default)]
struct StatsTable {
    records: HashMap<String, CallStats>,
    generation: u64,
}

#[derive(Default)]
pub struct CallStatsRecorder {
    table: Mutex<StatsTable>,
    writer: Option<Arc<SnapshotWriter>>,
}

impl CallStatsRecorder {
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match state_file::load_json::<HashMap<String, CallStats>>(&path) {
            Ok(records) => records.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable stats file");
                HashMap::new()
            }
        };
        Self {
            table: Mutex::new(StatsTable {
                records,
                generation: 0,
            }),
            writer: Some(Arc::new(SnapshotWriter::new(path))),
        }
    }

    /// Counts one call for `key` and returns the updated counters. The in-memory update
    /// always happens; only the write to disk can fail. The write runs on the blocking pool.
    pub async fn record(&self, key: &str, now: OffsetDateTime) -> Result<CallStats, StateFileError> {
        let (updated, snapshot) = self.count(key, now);
        let Some(writer) = self.writer.clone() else {
            return Ok(updated);
        };
        tokio::task::spawn_blocking(move || write_snapshot(&writer, snapshot))
            .await
            .map_err(|err| StateFileError::Write(std::io::Error::other(err)))??;
        Ok(updated)
    }

    /// Like `record`, for callers that cannot wait: drop paths and threads outside a
    /// runtime. Write failures are logged.
    pub fn record_detached(&self, key: &str, now: OffsetDateTime) {
        let (_, snapshot) = self.count(key, now);
        let Some(writer) = self.writer.clone() else {
            return;
        };
        let write = move || {
            if let Err(err) = write_snapshot(&writer, snapshot) {
                tracing::warn!(path = %writer.path().display(), error = %err, "failed to persist call statistics");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    fn count(&self, key: &str, now: OffsetDateTime) -> (CallStats, Snapshot) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = table
            .records
            .entry(key.to_string())
            .or_insert_with(|| CallStats::first(now));
        stats.record(now);
        let updated = stats.clone();
        table.generation += 1;
        (updated, snapshot_of(&table))
    }

    pub fn get(&self, key: &str) -> Option<CallStats> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(key)
            .cloned()
    }

    pub fn last_call_at(&self, key: &str) -> Option<OffsetDateTime> {
        self.get(key).and_then(|stats| stats.last_call_at)
    }

    pub fn remove(&self, key: &str) -> Result<Option<CallStats>, StateFileError> {
        let (removed, snapshot) = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(removed) = table.records.remove(key) else {
                return Ok(None);
            };
            table.generation += 1;
            (removed, snapshot_of(&table))
        };
        self.persist(snapshot)?;
        Ok(Some(removed))
    }

    pub fn all(&self) -> BTreeMap<String, CallStats> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .records
            .iter()
            .map(|(key, stats)| (key.clone(), stats.clone()))
            .collect()
    }

    pub fn summary(&self, now: OffsetDateTime) -> StatsSummary {
        let api_key_stats = self.all();
        StatsSummary {
            export_time: now,
            total_calls: api_key_stats.values().map(|s| s.total_calls).sum(),
            today_calls: api_key_stats.values().map(|s| s.calls_on(now)).sum(),
            active_api_keys: api_key_stats.values().filter(|s| s.total_calls > 0).count(),
            api_key_stats,
        }
    }

    fn persist(&self, snapshot: Snapshot) -> Result<(), StateFileError> {
        match self.writer.as_ref() {
            Some(writer) => write_snapshot(writer, snapshot),
            None => Ok(()),
        }
    }
}

type Snapshot = (u64, BTreeMap<String, CallStats>);

fn write_snapshot(writer: &SnapshotWriter, (generation, records): Snapshot) -> Result<(), StateFileError> {
    writer.write(generation, &records)
}

fn snapshot_of(table: &StatsTable) -> Snapshot {
    let records = table
        .records
        .iter()
        .map(|(key, stats)| (key.clone(), stats.clone()))
        .collect();
    (table.generation, records)
}
