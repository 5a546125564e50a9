//! # Prediction History
//!
//! Every delivered prediction can be appended to a history store together with the
//! features that produced it. The store is a collaborator of the prediction path,
//! never a dependency of it: see [`crate::predict::predict_and_record`].
//!
//! Listings are always most recent first. Records created within the same second
//! fall back to their id, which grows with every append.

use crate::learner::Outcome;
use crate::provision::ModelVariant;
use crate::schema::{FeatureMapping, all_features};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::cmp::Reverse;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Stored in place of an empty username.
pub const DEFAULT_USERNAME: &str = "unknown_user";
pub const HISTORY_PATH_ENV: &str = "RLT_HISTORY_PATH";
pub const DEFAULT_HISTORY_PATH: &str = "prediction_history.tsv";

/// Fixed leading columns of the history file; feature columns follow in schema order.
const FIXED_COLUMNS: [&str; 7] = [
    "id",
    "patient_id",
    "username",
    "timestamp",
    "result",
    "probability",
    "model_type",
];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to access prediction history at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read or write prediction history at {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Prediction history at {} is malformed (line {line}): {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the caller hands to [`HistoryStore::append`]. Id and timestamp are assigned
/// by the store.
#[derive(Debug, Clone, Copy)]
pub struct NewRecord<'a> {
    pub patient_id: &'a str,
    pub username: &'a str,
    pub features: &'a FeatureMapping,
    pub label: Outcome,
    /// Positive-class probability reported by the meta learner.
    pub probability: f64,
    pub variant: ModelVariant,
}

/// A stored prediction, including the features it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub id: RecordId,
    pub patient_id: String,
    pub username: String,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub features: FeatureMapping,
    pub label: Outcome,
    pub probability: f64,
    pub variant: ModelVariant,
}

/// A listing row: everything but the features.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
    pub id: RecordId,
    pub patient_id: String,
    pub username: String,
    pub timestamp: u64,
    pub label: Outcome,
    pub probability: f64,
    pub variant: ModelVariant,
}

impl PredictionRecord {
    fn from_new(id: RecordId, timestamp: u64, record: &NewRecord<'_>) -> Self {
        Self {
            id,
            patient_id: record.patient_id.to_string(),
            username: normalize_username(record.username),
            timestamp,
            features: record.features.clone(),
            label: record.label,
            probability: record.probability,
            variant: record.variant,
        }
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id,
            patient_id: self.patient_id.clone(),
            username: self.username.clone(),
            timestamp: self.timestamp,
            label: self.label,
            probability: self.probability,
            variant: self.variant,
        }
    }
}

/// Storage for past predictions.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: NewRecord<'_>) -> Result<RecordId, StorageError>;

    fn get(&self, id: RecordId) -> Result<Option<PredictionRecord>, StorageError>;

    /// Every record, most recent first.
    fn list_all(&self) -> Result<Vec<RecordSummary>, StorageError>;

    /// Records of one user, most recent first. An empty name selects the
    /// records stored under [`DEFAULT_USERNAME`].
    fn list_by_user(&self, username: &str) -> Result<Vec<RecordSummary>, StorageError>;
}

pub fn normalize_username(username: &str) -> String {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        DEFAULT_USERNAME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn most_recent_first<'a>(
    records: impl Iterator<Item = &'a PredictionRecord>,
    username: Option<&str>,
) -> Vec<RecordSummary> {
    let mut summaries: Vec<RecordSummary> = records
        .filter(|record| username.is_none_or(|name| record.username == name))
        .map(PredictionRecord::summary)
        .collect();
    summaries.sort_by_key(|summary| Reverse((summary.timestamp, summary.id)));
    summaries
}

// ========================================================================================
//                                  In-memory store
// ========================================================================================

/// A process-local history, used by tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    records: Mutex<Vec<PredictionRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for InMemoryHistory {
    fn append(&self, record: NewRecord<'_>) -> Result<RecordId, StorageError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let id = RecordId(records.len() as u64 + 1);
        records.push(PredictionRecord::from_new(id, unix_now(), &record));
        Ok(id)
    }

    fn get(&self, id: RecordId) -> Result<Option<PredictionRecord>, StorageError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.iter().find(|record| record.id == id).cloned())
    }

    fn list_all(&self) -> Result<Vec<RecordSummary>, StorageError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(most_recent_first(records.iter(), None))
    }

    fn list_by_user(&self, username: &str) -> Result<Vec<RecordSummary>, StorageError> {
        let username = normalize_username(username);
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(most_recent_first(records.iter(), Some(&username)))
    }
}

// ========================================================================================
//                                  Tab-separated file store
// ========================================================================================

/// An append-only, tab-separated history file with a header row.
///
/// Each feature gets its own column, named after the feature and laid out in
/// schema order. A feature absent from a record is written as an empty cell.
#[derive(Debug)]
pub struct TsvHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TsvHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header() -> Vec<&'static str> {
        FIXED_COLUMNS.into_iter().chain(all_features()).collect()
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_error(&self, source: csv::Error) -> StorageError {
        StorageError::Csv {
            path: self.path.clone(),
            source,
        }
    }

    fn malformed(&self, line: u64, reason: impl Into<String>) -> StorageError {
        StorageError::Malformed {
            path: self.path.clone(),
            line,
            reason: reason.into(),
        }
    }

    fn read_all(&self) -> Result<Vec<PredictionRecord>, StorageError> {
        // An empty file is treated like a missing one; append writes the header.
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() == 0 => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        }
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(&self.path)
            .map_err(|e| self.csv_error(e))?;

        let header = reader.headers().map_err(|e| self.csv_error(e))?.clone();
        let expected = Self::header();
        if !header.iter().eq(expected.iter().copied()) {
            return Err(self.malformed(
                1,
                "header does not match the current feature schema",
            ));
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| self.csv_error(e))?;
            records.push(self.parse_row(&row)?);
        }
        Ok(records)
    }

    fn parse_row(&self, row: &StringRecord) -> Result<PredictionRecord, StorageError> {
        let line = row.position().map_or(0, |position| position.line());
        let field = |index: usize| row.get(index).unwrap_or("");

        let id = field(0)
            .parse::<u64>()
            .map_err(|e| self.malformed(line, format!("invalid id '{}': {e}", field(0))))?;
        let timestamp = field(3).parse::<u64>().map_err(|e| {
            self.malformed(line, format!("invalid timestamp '{}': {e}", field(3)))
        })?;
        let label = Outcome::from_code(field(4))
            .ok_or_else(|| self.malformed(line, format!("unknown result '{}'", field(4))))?;
        let probability = field(5).parse::<f64>().map_err(|e| {
            self.malformed(line, format!("invalid probability '{}': {e}", field(5)))
        })?;
        let variant = ModelVariant::parse(field(6))
            .ok_or_else(|| self.malformed(line, format!("unknown model type '{}'", field(6))))?;

        let mut features = FeatureMapping::new();
        for (offset, name) in all_features().enumerate() {
            let cell = field(FIXED_COLUMNS.len() + offset);
            if cell.is_empty() {
                continue;
            }
            let value = cell.parse::<f64>().map_err(|e| {
                self.malformed(line, format!("invalid value '{cell}' for '{name}': {e}"))
            })?;
            features.insert(name.to_string(), value);
        }

        Ok(PredictionRecord {
            id: RecordId(id),
            patient_id: field(1).to_string(),
            username: field(2).to_string(),
            timestamp,
            features,
            label,
            probability,
            variant,
        })
    }

    fn encode_row(record: &PredictionRecord) -> Vec<String> {
        let mut row = vec![
            record.id.to_string(),
            record.patient_id.clone(),
            record.username.clone(),
            record.timestamp.to_string(),
            record.label.code().to_string(),
            record.probability.to_string(),
            record.variant.as_str().to_string(),
        ];
        row.extend(all_features().map(|name| {
            record
                .features
                .get(name)
                .map_or_else(String::new, |value| value.to_string())
        }));
        row
    }
}

impl HistoryStore for TsvHistory {
    fn append(&self, record: NewRecord<'_>) -> Result<RecordId, StorageError> {
        let guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let next = self
            .read_all()?
            .iter()
            .map(|existing| existing.id.0)
            .max()
            .unwrap_or(0)
            + 1;
        let stored = PredictionRecord::from_new(RecordId(next), unix_now(), &record);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        let is_new = file.metadata().map_err(|e| self.io_error(e))?.len() == 0;

        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer
                .write_record(Self::header())
                .map_err(|e| self.csv_error(e))?;
        }
        writer
            .write_record(Self::encode_row(&stored))
            .map_err(|e| self.csv_error(e))?;
        writer.flush().map_err(|e| self.io_error(e))?;
        drop(guard);

        log::debug!(
            "Appended history record {} for patient '{}' to {}",
            stored.id,
            stored.patient_id,
            self.path.display()
        );
        Ok(stored.id)
    }

    fn get(&self, id: RecordId) -> Result<Option<PredictionRecord>, StorageError> {
        Ok(self.read_all()?.into_iter().find(|record| record.id == id))
    }

    fn list_all(&self) -> Result<Vec<RecordSummary>, StorageError> {
        Ok(most_recent_first(self.read_all()?.iter(), None))
    }

    fn list_by_user(&self, username: &str) -> Result<Vec<RecordSummary>, StorageError> {
        let username = normalize_username(username);
        Ok(most_recent_first(self.read_all()?.iter(), Some(&username)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::zero_mapping;
    use tempfile::tempdir;

    fn new_record<'a>(
        patient_id: &'a str,
        username: &'a str,
        features: &'a FeatureMapping,
    ) -> NewRecord<'a> {
        NewRecord {
            patient_id,
            username,
            features,
            label: Outcome::FullyBeneficial,
            probability: 0.8125,
            variant: ModelVariant::StandIn,
        }
    }

    #[test]
    fn test_empty_username_is_replaced() {
        assert_eq!(normalize_username(""), DEFAULT_USERNAME);
        assert_eq!(normalize_username("   "), DEFAULT_USERNAME);
        assert_eq!(normalize_username(" dr.li "), "dr.li");
    }

    #[test]
    fn test_in_memory_listing_is_most_recent_first() {
        let history = InMemoryHistory::new();
        let features = zero_mapping();
        for patient in ["p1", "p2", "p3"] {
            history.append(new_record(patient, "alice", &features)).unwrap();
        }
        let listed: Vec<_> = history
            .list_all()
            .unwrap()
            .into_iter()
            .map(|summary| summary.patient_id)
            .collect();
        assert_eq!(listed, vec!["p3", "p2", "p1"]);
    }

    #[test]
    fn test_ordering_prefers_timestamp_over_id() {
        let features = zero_mapping();
        let mut early = PredictionRecord::from_new(RecordId(2), 100, &new_record("late-id", "a", &features));
        let late = PredictionRecord::from_new(RecordId(1), 200, &new_record("early-id", "a", &features));
        let listed = most_recent_first([&early, &late].into_iter(), None);
        assert_eq!(listed[0].id, RecordId(1));

        early.timestamp = 200;
        let listed = most_recent_first([&early, &late].into_iter(), None);
        assert_eq!(listed[0].id, RecordId(2));
    }

    #[test]
    fn test_in_memory_filters_by_user() {
        let history = InMemoryHistory::new();
        let features = zero_mapping();
        history.append(new_record("p1", "alice", &features)).unwrap();
        history.append(new_record("p2", "bob", &features)).unwrap();
        history.append(new_record("p3", "", &features)).unwrap();
        history.append(new_record("p4", "alice", &features)).unwrap();

        let alice: Vec<_> = history
            .list_by_user("alice")
            .unwrap()
            .into_iter()
            .map(|summary| summary.patient_id)
            .collect();
        assert_eq!(alice, vec!["p4", "p1"]);
        assert_eq!(history.list_by_user("").unwrap()[0].patient_id, "p3");
        assert!(history.list_by_user("carol").unwrap().is_empty());
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_tsv_history_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.tsv");
        let mut features = zero_mapping();
        features.insert("Neutrophils (G/L)".to_string(), 71.5);
        features.insert("Liver involvement".to_string(), 1.0);

        let history = TsvHistory::new(&path);
        assert!(history.list_all().unwrap().is_empty());
        let first = history.append(new_record("p\t1", "alice", &features)).unwrap();
        let second = history.append(new_record("p2", "", &features)).unwrap();
        assert_eq!((first, second), (RecordId(1), RecordId(2)));

        let reopened = TsvHistory::new(&path);
        let record = reopened.get(first).unwrap().unwrap();
        assert_eq!(record.patient_id, "p\t1");
        assert_eq!(record.features, features);
        assert_eq!(record.label, Outcome::FullyBeneficial);
        assert_eq!(record.probability, 0.8125);
        assert_eq!(record.variant, ModelVariant::StandIn);
        assert!(reopened.get(RecordId(9)).unwrap().is_none());

        let listed = reopened.list_all().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[0].username, DEFAULT_USERNAME);

        let contents = std::fs::read_to_string(&path).unwrap();
        let header = contents.lines().next().unwrap();
        assert!(header.starts_with("id\tpatient_id\tusername\ttimestamp\tresult"));
        assert!(header.ends_with("PSMA-/Choline+"));
        assert_eq!(contents.matches("model_type").count(), 1);
    }

    #[test]
    fn test_tsv_history_starts_over_on_an_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.tsv");
        std::fs::write(&path, "").unwrap();

        let history = TsvHistory::new(&path);
        assert!(history.list_all().unwrap().is_empty());
        let id = history.append(new_record("p1", "alice", &zero_mapping())).unwrap();
        assert_eq!(id, RecordId(1));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("id\tpatient_id\tusername\ttimestamp\tresult"));
        assert_eq!(contents.lines().count(), 2);
        assert_eq!(history.get(id).unwrap().unwrap().patient_id, "p1");
    }

    #[test]
    fn test_tsv_history_rejects_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.tsv");
        std::fs::write(&path, "id\tpatient\n1\tp1\n").unwrap();
        let history = TsvHistory::new(&path);
        assert!(matches!(
            history.list_all(),
            Err(StorageError::Malformed { line: 1, .. })
        ));
        assert!(history.append(new_record("p2", "a", &zero_mapping())).is_err());
    }
}
