use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("read state file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse state file failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("write state file failed: {0}")]
    Write(std::io::Error),
}

/// Reads a JSON record. A file that does not exist is `Ok(None)`.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>, StateFileError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StateFileError::Read(err)),
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn save_json<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), StateFileError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(StateFileError::Write)?;
        }
    }

    let payload = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("tmp");

    if fs::write(&tmp_path, &payload).is_err() {
        fs::write(path, &payload).map_err(StateFileError::Write)?;
        return Ok(());
    }

    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::write(path, &payload).map_err(StateFileError::Write)?;
            let _ = fs::remove_file(&tmp_path);
            Ok(())
        }
    }
}

/// Serializes writes of one record and drops snapshots older than the last one written.
///
/// Callers take a generation number under the lock that guards the in-memory data, copy the
/// data, release that lock and then hand both here. Disk writes therefore never happen under
/// a data lock, and a slow writer cannot overwrite a newer snapshot with an older one.
#[derive(Debug)]
pub struct SnapshotWriter {
    path: PathBuf,
    last_generation: Mutex<u64>,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_generation: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize + ?Sized>(
        &self,
        generation: u64,
        value: &T,
    ) -> Result<(), StateFileError> {
        let mut last = self
            .last_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if generation <= *last {
            return Ok(());
        }
        save_json(&self.path, value)?;
        *last = generation;
        Ok(())
    }
}

/// Accepts RFC 3339 and, for files written by older releases, naive ISO 8601 timestamps.
///
/// Older releases wrote naive timestamps and `YYYY-MM-DD` day buckets in the host's local
/// time. They are read here as UTC, since `time` cannot reliably report the local offset in
/// a multi-threaded process. An imported `last_call` therefore shifts by the host's UTC
/// offset, and an imported `today` bucket may name the neighbouring UTC day, in which case
/// `calls_today` restarts at the next call. Everything written by this crate is RFC 3339
/// with an explicit offset.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(value);
    }
    let with_fraction = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    if let Ok(value) = PrimitiveDateTime::parse(raw, with_fraction) {
        return Ok(value.assume_utc());
    }
    let whole_seconds = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw, whole_seconds).map(PrimitiveDateTime::assume_utc)
}

/// `YYYY-MM-DD` bucket of an instant, always taken in UTC.
pub fn day_bucket(at: OffsetDateTime) -> String {
    let date = at.to_offset(time::UtcOffset::UTC).date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|raw| super::super::parse_timestamp(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Vec<u32>> = load_json(dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_json::<Vec<u32>>(&path).unwrap_err();
        assert!(matches!(err, StateFileError::Parse(_)));
    }

    #[test]
    fn snapshot_writer_skips_stale_generations() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("nested/state.json"));

        writer.write(2, &vec![2]).unwrap();
        writer.write(1, &vec![1]).unwrap();

        let loaded: Option<Vec<u32>> = load_json(writer.path()).unwrap();
        assert_eq!(loaded, Some(vec![2]));
    }

    #[test]
    fn legacy_naive_timestamps_are_read_as_utc() {
        let parsed = parse_timestamp("2024-03-01T08:30:00.123456").unwrap();
        assert_eq!(parsed.offset(), time::UtcOffset::UTC);
        assert_eq!(parsed.hour(), 8);

        let whole = parse_timestamp("2024-03-01T08:30:00").unwrap();
        assert_eq!(whole.unix_timestamp(), 1_709_281_800);

        let rfc = parse_timestamp("2024-03-01T08:30:00+02:00").unwrap();
        assert_eq!(rfc.unix_timestamp(), 1_709_274_600);
    }

    #[test]
    fn day_bucket_is_zero_padded() {
        let at = OffsetDateTime::from_unix_timestamp(1_704_153_600).unwrap();
        assert_eq!(day_bucket(at), "2024-01-02");
    }

    #[test]
    fn day_bucket_ignores_the_instant_offset() {
        let late_evening = parse_timestamp("2024-01-01T23:30:00-02:00").unwrap();
        assert_eq!(day_bucket(late_evening), "2024-01-02");

        // A naive legacy value carries no offset and lands on its own calendar day.
        let legacy = parse_timestamp("2024-01-01T23:30:00").unwrap();
        assert_eq!(day_bucket(legacy), "2024-01-01");
    }
}
