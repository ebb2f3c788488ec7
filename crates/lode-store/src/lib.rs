//! File-backed facility and relationship stores with backup-before-mutate
//! and an append-only audit journal.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use lode_core::{FacilityRecord, Gate, MatchMethod, MentionRole, Relationship, RelationshipKey};

pub const CRATE_NAME: &str = "lode-store";

const AUDIT_FILE: &str = "audit.jsonl";
const BACKUP_DIR: &str = "backups";

/// One schema rule the record under write failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record on disk could not be decoded. Batch loads skip these.
    #[error("malformed record {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    /// The write would violate the record schema; prior state is untouched.
    #[error("validation failed for {facility_id}: {} violation(s)", .violations.len())]
    Validation {
        facility_id: String,
        violations: Vec<Violation>,
    },
    #[error("encoding {what}: {message}")]
    Encode { what: String, message: String },
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Schema validation seam. The full rule set lives outside this system;
/// `BaselineValidator` enforces the invariants the stores rely on.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, record: &FacilityRecord) -> Vec<Violation>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BaselineValidator;

impl RecordValidator for BaselineValidator {
    fn validate(&self, record: &FacilityRecord) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut push = |field: &str, message: String| {
            violations.push(Violation {
                field: field.to_string(),
                message,
            })
        };

        if record.facility_id.trim().is_empty() {
            push("facility_id", "must not be empty".to_string());
        } else {
            let prefix = format!("{}-", record.country_code.to_lowercase());
            if !record.facility_id.starts_with(&prefix) {
                push(
                    "facility_id",
                    format!("must start with country prefix `{prefix}`"),
                );
            }
        }
        if record.name.trim().is_empty() {
            push("name", "must not be empty".to_string());
        }
        if !(2..=3).contains(&record.country_code.len())
            || !record
                .country_code
                .chars()
                .all(|c| c.is_ascii_uppercase())
        {
            push(
                "country_code",
                format!("`{}` is not an uppercase ISO code", record.country_code),
            );
        }
        if record.facility_types.is_empty() {
            push("facility_types", "at least one type tag required".to_string());
        }
        if !(0.0..=1.0).contains(&record.verification.confidence) {
            push(
                "verification.confidence",
                format!("{} outside [0, 1]", record.verification.confidence),
            );
        }
        for mention in &record.mentions {
            if !(0.0..=1.0).contains(&mention.confidence) {
                push(
                    "mentions.confidence",
                    format!("`{}` has confidence {}", mention.raw_name, mention.confidence),
                );
            }
        }
        if let Some(location) = &record.location {
            if !(-90.0..=90.0).contains(&location.latitude)
                || !(-180.0..=180.0).contains(&location.longitude)
            {
                push(
                    "location",
                    format!("({}, {}) out of range", location.latitude, location.longitude),
                );
            }
        }
        violations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Created,
    Updated,
    /// Serialized form matched the stored bytes; nothing was touched.
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRecord {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub records: Vec<FacilityRecord>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct AuditEntry<'a> {
    at: DateTime<Utc>,
    op: &'a str,
    facility_id: &'a str,
    detail: &'a str,
}

/// One JSON file per facility under `<root>/<COUNTRY>/<facility_id>.json`.
/// Mutations back up the previous version and replace atomically.
#[derive(Debug, Clone)]
pub struct FacilityStore {
    root: PathBuf,
}

impl FacilityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, country_code: &str, facility_id: &str) -> PathBuf {
        self.root
            .join(country_code.to_ascii_uppercase())
            .join(format!("{facility_id}.json"))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Read every record in scope (a country code, or the whole store).
    /// Malformed files are skipped, reported, and logged; they never abort
    /// the batch. Records come back sorted by `facility_id`.
    pub async fn load_scope(&self, scope: Option<&str>) -> Result<LoadOutcome, StoreError> {
        let mut outcome = LoadOutcome::default();
        if !fs::try_exists(&self.root).await? {
            return Ok(outcome);
        }

        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if dir_name == BACKUP_DIR {
                continue;
            }
            if let Some(country) = scope {
                if !dir_name.eq_ignore_ascii_case(country) {
                    continue;
                }
            }

            let mut files = fs::read_dir(entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let text = fs::read_to_string(&path).await?;
                match serde_json::from_str::<FacilityRecord>(&text) {
                    Ok(record) => outcome.records.push(record),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping malformed record");
                        outcome.skipped.push(SkippedRecord {
                            path,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        outcome.records.sort_by(|a, b| a.facility_id.cmp(&b.facility_id));
        Ok(outcome)
    }

    pub async fn load(&self, country_code: &str, facility_id: &str) -> Result<FacilityRecord, StoreError> {
        let path = self.record_path(country_code, facility_id);
        let text = fs::read_to_string(&path).await?;
        serde_json::from_str(&text).map_err(|err| StoreError::Malformed {
            path,
            message: err.to_string(),
        })
    }

    /// Validate, back up any previous version, then atomically replace.
    /// A byte-identical serialized form short-circuits to `Unchanged`.
    pub async fn save(
        &self,
        record: &FacilityRecord,
        validator: &dyn RecordValidator,
    ) -> Result<SaveOutcome, StoreError> {
        let violations = validator.validate(record);
        if !violations.is_empty() {
            return Err(StoreError::Validation {
                facility_id: record.facility_id.clone(),
                violations,
            });
        }

        let path = self.record_path(&record.country_code, &record.facility_id);
        let mut bytes = serde_json::to_vec_pretty(record).map_err(|err| StoreError::Encode {
            what: record.facility_id.clone(),
            message: err.to_string(),
        })?;
        bytes.push(b'\n');

        let existing = match fs::read(&path).await {
            Ok(prior) => Some(prior),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if let Some(prior) = &existing {
            if Self::sha256_hex(prior) == Self::sha256_hex(&bytes) {
                return Ok(SaveOutcome::Unchanged);
            }
            self.backup(&record.facility_id, prior).await?;
        }

        self.write_atomic(&path, &bytes).await?;

        let (op, outcome) = if existing.is_some() {
            ("update", SaveOutcome::Updated)
        } else {
            ("create", SaveOutcome::Created)
        };
        self.append_audit(op, &record.facility_id, &path.display().to_string())
            .await?;
        Ok(outcome)
    }

    /// Back up then delete. Used when a record loses a duplicate merge.
    pub async fn remove(&self, record: &FacilityRecord, reason: &str) -> Result<(), StoreError> {
        let path = self.record_path(&record.country_code, &record.facility_id);
        match fs::read(&path).await {
            Ok(prior) => {
                self.backup(&record.facility_id, &prior).await?;
                fs::remove_file(&path).await?;
                self.append_audit("remove", &record.facility_id, reason).await?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn backup(&self, facility_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let dir = self.root.join(BACKUP_DIR);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{facility_id}.{stamp}.json"));
        self.write_atomic(&path, bytes).await
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path.parent().expect("record path always has parent");
        fs::create_dir_all(parent).await?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn append_audit(&self, op: &str, facility_id: &str, detail: &str) -> Result<(), StoreError> {
        let entry = AuditEntry {
            at: Utc::now(),
            op,
            facility_id,
            detail,
        };
        let mut line = serde_json::to_vec(&entry).map_err(|err| StoreError::Encode {
            what: AUDIT_FILE.to_string(),
            message: err.to_string(),
        })?;
        line.push(b'\n');

        fs::create_dir_all(&self.root).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(AUDIT_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Row already carried the same resolution; nothing changed.
    Unchanged,
}

/// In-memory relationship table with upsert-by-natural-key semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipTable {
    rows: Vec<Relationship>,
}

impl RelationshipTable {
    pub fn rows(&self) -> &[Relationship] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RelationshipKey) -> Option<&Relationship> {
        self.rows.iter().find(|r| &r.natural_key() == key)
    }

    /// Insert or update under the natural key. An update keeps the existing
    /// `relationship_id` and `created_at` so re-resolution never mints new
    /// identities for the same link.
    pub fn upsert(&mut self, incoming: Relationship) -> UpsertOutcome {
        let key = incoming.natural_key();
        match self.rows.iter_mut().find(|r| r.natural_key() == key) {
            Some(existing) => {
                let replacement = Relationship {
                    relationship_id: existing.relationship_id,
                    created_at: existing.created_at,
                    ..incoming
                };
                if *existing == replacement {
                    UpsertOutcome::Unchanged
                } else {
                    *existing = replacement;
                    UpsertOutcome::Updated
                }
            }
            None => {
                self.rows.push(incoming);
                UpsertOutcome::Inserted
            }
        }
    }

    pub fn by_gate(&self, gate: Gate) -> Vec<&Relationship> {
        self.rows.iter().filter(|r| r.gate == gate).collect()
    }

    pub fn by_facility(&self, facility_id: &str) -> Vec<&Relationship> {
        self.rows
            .iter()
            .filter(|r| r.facility_id == facility_id)
            .collect()
    }
}

/// Whole-table JSON persistence for relationships, written atomically.
#[derive(Debug, Clone)]
pub struct RelationshipStore {
    path: PathBuf,
}

impl RelationshipStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<RelationshipTable, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|err| StoreError::Malformed {
                path: self.path.clone(),
                message: err.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(RelationshipTable::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, table: &RelationshipTable) -> Result<(), StoreError> {
        let mut sorted = table.clone();
        sorted.rows.sort_by_key(|r| r.natural_key());
        let mut bytes = serde_json::to_vec_pretty(&sorted).map_err(|err| StoreError::Encode {
            what: self.path.display().to_string(),
            message: err.to_string(),
        })?;
        bytes.push(b'\n');

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);
        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetSnapshot {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn role_str(role: MentionRole) -> &'static str {
    match role {
        MentionRole::Operator => "operator",
        MentionRole::Owner => "owner",
        MentionRole::Unknown => "unknown",
    }
}

fn gate_str(gate: Gate) -> &'static str {
    match gate {
        Gate::AutoAccept => "auto_accept",
        Gate::Review => "review",
        Gate::Pending => "pending",
    }
}

fn match_method_str(method: MatchMethod) -> &'static str {
    match method {
        MatchMethod::ExactName => "exact_name",
        MatchMethod::AliasMatch => "alias_match",
        MatchMethod::FuzzyName => "fuzzy_name",
    }
}

/// Columnar snapshot of the relationship table for downstream review
/// tooling.
pub fn export_relationships_parquet(
    path: &Path,
    rows: &[Relationship],
) -> anyhow::Result<ParquetSnapshot> {
    use anyhow::Context;

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("relationship_id", DataType::Utf8, false),
        ArrowField::new("facility_id", DataType::Utf8, false),
        ArrowField::new("company_id", DataType::Utf8, false),
        ArrowField::new("role", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Float64, false),
        ArrowField::new("base_confidence", DataType::Float64, false),
        ArrowField::new("gate", DataType::Utf8, false),
        ArrowField::new("match_method", DataType::Utf8, false),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let relationship_ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.relationship_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let facility_ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.facility_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let company_ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.company_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let roles = StringArray::from(rows.iter().map(|r| Some(role_str(r.role))).collect::<Vec<_>>());
    let confidences = Float64Array::from(rows.iter().map(|r| r.confidence).collect::<Vec<_>>());
    let base_confidences =
        Float64Array::from(rows.iter().map(|r| r.base_confidence).collect::<Vec<_>>());
    let gates = StringArray::from(rows.iter().map(|r| Some(gate_str(r.gate))).collect::<Vec<_>>());
    let methods = StringArray::from(
        rows.iter()
            .map(|r| Some(match_method_str(r.match_method)))
            .collect::<Vec<_>>(),
    );
    let created = StringArray::from(
        rows.iter()
            .map(|r| Some(r.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(relationship_ids),
            Arc::new(facility_ids),
            Arc::new(company_ids),
            Arc::new(roles),
            Arc::new(confidences),
            Arc::new(base_confidences),
            Arc::new(gates),
            Arc::new(methods),
            Arc::new(created),
        ],
    )
    .context("building relationships record batch")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;

    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ParquetSnapshot {
        path: path.to_path_buf(),
        sha256: FacilityStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows: rows.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lode_core::{
        FacilityStatus, Location, LocationPrecision, Verification, VerificationStatus,
    };
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn record(facility_id: &str, name: &str) -> FacilityRecord {
        FacilityRecord {
            facility_id: facility_id.to_string(),
            name: name.to_string(),
            aliases: BTreeSet::new(),
            country_code: "ZA".to_string(),
            location: Some(Location {
                latitude: -24.893,
                longitude: 30.124,
                precision: LocationPrecision::Exact,
            }),
            facility_types: BTreeSet::from(["mine".to_string()]),
            commodities: Vec::new(),
            products: Vec::new(),
            status: FacilityStatus::Operating,
            mentions: Vec::new(),
            sources: Vec::new(),
            verification: Verification {
                status: VerificationStatus::CsvImported,
                confidence: 0.6,
                last_checked: None,
                notes: String::new(),
            },
        }
    }

    fn relationship(facility_id: &str, company_id: &str, confidence: f64) -> Relationship {
        Relationship {
            relationship_id: Uuid::new_v4(),
            facility_id: facility_id.to_string(),
            company_id: company_id.to_string(),
            role: MentionRole::Operator,
            confidence,
            base_confidence: confidence,
            gate: Gate::Review,
            match_method: MatchMethod::FuzzyName,
            evidence: "test".to_string(),
            gates_applied: Vec::new(),
            created_at: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn save_creates_then_short_circuits_then_backs_up() {
        let dir = tempdir().unwrap();
        let store = FacilityStore::new(dir.path());
        let validator = BaselineValidator;
        let mut rec = record("za-two-rivers-001", "Two Rivers Platinum Mine");

        assert!(matches!(
            store.save(&rec, &validator).await.unwrap(),
            SaveOutcome::Created
        ));
        assert!(matches!(
            store.save(&rec, &validator).await.unwrap(),
            SaveOutcome::Unchanged
        ));
        assert!(!dir.path().join(BACKUP_DIR).exists());

        rec.aliases.insert("Two Rivers".to_string());
        assert!(matches!(
            store.save(&rec, &validator).await.unwrap(),
            SaveOutcome::Updated
        ));

        let backups: Vec<_> = std::fs::read_dir(dir.path().join(BACKUP_DIR))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);

        // No temp files leak next to the record.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("ZA"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let audit = std::fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        assert_eq!(audit.lines().count(), 2); // create + update, no line for unchanged
    }

    #[tokio::test]
    async fn validation_failure_leaves_prior_bytes_intact() {
        let dir = tempdir().unwrap();
        let store = FacilityStore::new(dir.path());
        let validator = BaselineValidator;
        let rec = record("za-karee-001", "Karee Shaft");
        store.save(&rec, &validator).await.unwrap();
        let before = std::fs::read(store.record_path("ZA", "za-karee-001")).unwrap();

        let mut bad = rec.clone();
        bad.verification.confidence = 3.0;
        bad.name.clear();
        let err = store.save(&bad, &validator).await.unwrap_err();
        match err {
            StoreError::Validation { violations, .. } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        let after = std::fs::read(store.record_path("ZA", "za-karee-001")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn remove_backs_up_before_delete() {
        let dir = tempdir().unwrap();
        let store = FacilityStore::new(dir.path());
        let rec = record("za-karee-001", "Karee Shaft");
        store.save(&rec, &BaselineValidator).await.unwrap();

        store.remove(&rec, "merged into za-two-rivers-001").await.unwrap();
        assert!(!store.record_path("ZA", "za-karee-001").exists());
        let backups: Vec<_> = std::fs::read_dir(dir.path().join(BACKUP_DIR))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn load_scope_skips_malformed_and_filters_by_country() {
        let dir = tempdir().unwrap();
        let store = FacilityStore::new(dir.path());
        store.save(&record("za-a-001", "Alpha"), &BaselineValidator).await.unwrap();
        let mut au = record("au-b-001", "Beta");
        au.country_code = "AU".to_string();
        store.save(&au, &BaselineValidator).await.unwrap();
        std::fs::write(dir.path().join("ZA").join("broken.json"), b"{ not json").unwrap();

        let all = store.load_scope(None).await.unwrap();
        assert_eq!(all.records.len(), 2);
        assert_eq!(all.skipped.len(), 1);

        let za_only = store.load_scope(Some("za")).await.unwrap();
        assert_eq!(za_only.records.len(), 1);
        assert_eq!(za_only.records[0].facility_id, "za-a-001");
    }

    #[tokio::test]
    async fn relationship_upsert_is_idempotent_and_preserves_identity() {
        let dir = tempdir().unwrap();
        let store = RelationshipStore::new(dir.path().join("relationships.json"));
        let mut table = store.load().await.unwrap();

        let first = relationship("za-a-001", "cmp-001", 0.8);
        assert_eq!(table.upsert(first.clone()), UpsertOutcome::Inserted);
        let original_id = table.rows()[0].relationship_id;

        // Re-resolution with identical values changes nothing.
        let again = relationship("za-a-001", "cmp-001", 0.8);
        assert_eq!(table.upsert(again), UpsertOutcome::Unchanged);
        assert_eq!(table.len(), 1);

        // Updated confidence keeps the original row identity.
        let mut revised = relationship("za-a-001", "cmp-001", 0.92);
        revised.gate = Gate::AutoAccept;
        assert_eq!(table.upsert(revised), UpsertOutcome::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].relationship_id, original_id);
        assert_eq!(table.rows()[0].gate, Gate::AutoAccept);

        store.save(&table).await.unwrap();
        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.rows()[0].relationship_id, original_id);
    }

    #[tokio::test]
    async fn relationship_filters_by_gate_and_facility() {
        let mut table = RelationshipTable::default();
        table.upsert(relationship("za-a-001", "cmp-001", 0.8));
        let mut auto = relationship("za-a-001", "cmp-002", 0.95);
        auto.gate = Gate::AutoAccept;
        table.upsert(auto);
        table.upsert(relationship("au-b-001", "cmp-001", 0.8));

        assert_eq!(table.by_gate(Gate::Review).len(), 2);
        assert_eq!(table.by_gate(Gate::AutoAccept).len(), 1);
        assert_eq!(table.by_facility("za-a-001").len(), 2);
    }

    #[test]
    fn parquet_snapshot_is_written_and_hashed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots").join("relationships.parquet");
        let rows = vec![
            relationship("za-a-001", "cmp-001", 0.8),
            relationship("za-a-001", "cmp-002", 0.95),
        ];
        let snapshot = export_relationships_parquet(&path, &rows).unwrap();
        assert!(path.exists());
        assert_eq!(snapshot.rows, 2);
        assert_eq!(snapshot.sha256.len(), 64);
        assert!(snapshot.bytes > 0);
    }
}
