//! Batch orchestration: plan-then-apply deduplication and concurrent
//! mention resolution, each writing a per-run report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use lode_core::{FacilityRecord, Gate, Relationship, RelationshipKey};
use lode_registry::{CompanyRegistry, LookupCache};
use lode_store::{
    export_relationships_parquet, FacilityStore, RecordValidator, RelationshipStore, StoreError,
    UpsertOutcome,
};

use crate::dedup::{default_cascade, merge_group, plan_groups, DuplicateGroup};
use crate::resolve::{resolve_mentions, MentionResolution, ResolutionProfile, Shortlist};

#[derive(Debug, Clone)]
pub struct DedupeOptions {
    /// Country-code restriction; `None` runs the whole store.
    pub scope: Option<String>,
    pub dry_run: bool,
    pub reports_root: PathBuf,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            scope: None,
            dry_run: false,
            reports_root: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub dry_run: bool,
    pub scanned: usize,
    pub skipped_records: usize,
    pub group_count: usize,
    pub merged_records: usize,
    pub tie_breaks: usize,
    pub validation_failures: usize,
    pub reports_dir: String,
}

/// Plan duplicate groups against a stable snapshot, then (unless dry-run)
/// apply each merge: survivor saved, losers backed up and removed. Each
/// group commits independently, so an interrupted run leaves only whole
/// merges behind and a re-run finds nothing left to do.
pub async fn run_dedupe(
    store: &FacilityStore,
    validator: &dyn RecordValidator,
    options: &DedupeOptions,
) -> Result<DedupeSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, scope = options.scope.as_deref().unwrap_or("all"), "dedupe run started");

    let outcome = store
        .load_scope(options.scope.as_deref())
        .await
        .context("loading facility records")?;
    let groups = plan_groups(&outcome.records, &default_cascade());
    let tie_breaks = groups.iter().filter(|g| g.tie_break).count();

    let mut by_id: BTreeMap<&str, &FacilityRecord> = BTreeMap::new();
    for record in &outcome.records {
        by_id.insert(record.facility_id.as_str(), record);
    }

    let mut merged_records = 0usize;
    let mut validation_failures = 0usize;

    if !options.dry_run {
        for group in &groups {
            let members: Vec<&FacilityRecord> = group
                .member_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            let merged = merge_group(&members);

            match store.save(&merged.survivor, validator).await {
                Ok(_) => {}
                Err(StoreError::Validation { facility_id, .. }) => {
                    error!(%facility_id, "merged survivor failed validation; group skipped");
                    validation_failures += 1;
                    continue;
                }
                Err(err) => return Err(err).context("writing merged survivor"),
            }
            for loser_id in &merged.loser_ids {
                if let Some(loser) = by_id.get(loser_id.as_str()) {
                    store
                        .remove(loser, &format!("merged into {}", merged.survivor.facility_id))
                        .await
                        .context("removing merged duplicate")?;
                    merged_records += 1;
                }
            }
        }
    }

    let finished_at = Utc::now();
    let reports_dir = options.reports_root.join(run_id.to_string());
    let summary = DedupeSummary {
        run_id,
        started_at,
        finished_at,
        scope: options.scope.clone(),
        dry_run: options.dry_run,
        scanned: outcome.records.len(),
        skipped_records: outcome.skipped.len(),
        group_count: groups.len(),
        merged_records,
        tie_breaks,
        validation_failures,
        reports_dir: reports_dir.display().to_string(),
    };

    write_dedupe_report(&reports_dir, &summary, &groups, &outcome.skipped).await?;
    info!(%run_id, groups = groups.len(), merged = merged_records, "dedupe run finished");
    Ok(summary)
}

async fn write_dedupe_report(
    reports_dir: &PathBuf,
    summary: &DedupeSummary,
    groups: &[DuplicateGroup],
    skipped: &[lode_store::SkippedRecord],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief = format!(
        "# Dedupe Brief\n\n- Run ID: `{}`\n- Scope: {}\n- Dry run: {}\n- Scanned: {}\n- Skipped (malformed): {}\n- Duplicate groups: {}\n- Records merged away: {}\n- Completeness ties: {}\n",
        summary.run_id,
        summary.scope.as_deref().unwrap_or("all"),
        summary.dry_run,
        summary.scanned,
        summary.skipped_records,
        summary.group_count,
        summary.merged_records,
        summary.tie_breaks,
    );
    fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;

    let detail = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "groups": groups,
        "skipped": skipped,
    }))
    .context("serializing dedupe report")?;
    fs::write(reports_dir.join("summary.json"), detail)
        .await
        .context("writing summary.json")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub scope: Option<String>,
    pub profile: ResolutionProfile,
    pub dry_run: bool,
    /// Per-invocation floor for the review gate.
    pub min_confidence: Option<f64>,
    pub reports_root: PathBuf,
    pub concurrency: usize,
}

impl ResolveOptions {
    pub fn new(profile: ResolutionProfile) -> Self {
        Self {
            scope: None,
            profile,
            dry_run: false,
            min_confidence: None,
            reports_root: PathBuf::from("reports"),
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub profile: String,
    pub dry_run: bool,
    pub facilities: usize,
    pub mentions: usize,
    pub auto_accepted: usize,
    pub review: usize,
    pub pending: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub relationships_total: usize,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
struct PendingMention {
    facility_id: String,
    raw_name: String,
    reason: String,
    confidence: f64,
}

struct FacilityOutcome {
    facility_id: String,
    resolutions: Vec<MentionResolution>,
}

/// Resolve every mention in scope. Facilities fan out under a bounded
/// semaphore (registry lookups are the only slow part); the relationship
/// table itself is only touched serially after all scoring completes.
pub async fn run_resolve(
    facility_store: &FacilityStore,
    relationship_store: &RelationshipStore,
    registry: Arc<dyn CompanyRegistry>,
    options: &ResolveOptions,
) -> Result<ResolveSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let profile = options
        .profile
        .clone()
        .with_min_confidence(options.min_confidence);
    info!(%run_id, profile = %profile.name, "resolution run started");

    let outcome = facility_store
        .load_scope(options.scope.as_deref())
        .await
        .context("loading facility records")?;
    let mut table = relationship_store
        .load()
        .await
        .context("loading relationship table")?;

    let cache = Arc::new(Mutex::new(LookupCache::new()));
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let profile = Arc::new(profile);

    let mut handles = Vec::with_capacity(outcome.records.len());
    for facility in outcome.records.iter().cloned() {
        let registry = Arc::clone(&registry);
        let cache = Arc::clone(&cache);
        let semaphore = Arc::clone(&semaphore);
        let profile = Arc::clone(&profile);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            let mut shortlists = Vec::with_capacity(facility.mentions.len());
            for mention in &facility.mentions {
                let country_hint = Some(facility.country_code.as_str());
                let cached = cache.lock().await.get(&mention.raw_name, country_hint);
                let shortlist = match cached {
                    Some(candidates) => Shortlist::Available(candidates),
                    None => match registry.query(&mention.raw_name, country_hint).await {
                        Ok(candidates) => {
                            cache.lock().await.put(
                                &mention.raw_name,
                                country_hint,
                                candidates.clone(),
                            );
                            Shortlist::Available(candidates)
                        }
                        Err(err) => {
                            warn!(
                                facility = %facility.facility_id,
                                raw_name = %mention.raw_name,
                                error = %err,
                                "registry lookup failed; mention degrades to pending"
                            );
                            Shortlist::Unavailable
                        }
                    },
                };
                shortlists.push(shortlist);
            }
            let resolutions = resolve_mentions(&facility, &shortlists, &profile);
            FacilityOutcome {
                facility_id: facility.facility_id.clone(),
                resolutions,
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.context("resolution task panicked")?);
    }

    let mut mentions = 0usize;
    let mut auto_accepted = 0usize;
    let mut review = 0usize;
    let mut pending_count = 0usize;
    let mut pendings: Vec<PendingMention> = Vec::new();
    // Highest-confidence row per natural key; two mentions of the same
    // company on one facility must not race each other in the table.
    let mut rows: BTreeMap<RelationshipKey, Relationship> = BTreeMap::new();

    for outcome in &outcomes {
        for resolution in &outcome.resolutions {
            mentions += 1;
            match resolution.gate {
                Gate::AutoAccept => auto_accepted += 1,
                Gate::Review => review += 1,
                Gate::Pending => {
                    pending_count += 1;
                    pendings.push(PendingMention {
                        facility_id: outcome.facility_id.clone(),
                        raw_name: resolution.raw_name.clone(),
                        reason: resolution
                            .pending_reason
                            .clone()
                            .unwrap_or_else(|| "below_review_threshold".to_string()),
                        confidence: resolution.confidence,
                    });
                }
            }
            if let Some(relationship) = resolution.to_relationship(&outcome.facility_id) {
                let key = relationship.natural_key();
                match rows.get(&key) {
                    Some(existing) if existing.confidence >= relationship.confidence => {}
                    _ => {
                        rows.insert(key, relationship);
                    }
                }
            }
        }
    }

    let mut inserted = 0usize;
    let mut updated = 0usize;
    let mut unchanged = 0usize;
    for (_, relationship) in rows {
        match table.upsert(relationship) {
            UpsertOutcome::Inserted => inserted += 1,
            UpsertOutcome::Updated => updated += 1,
            UpsertOutcome::Unchanged => unchanged += 1,
        }
    }

    let reports_dir = options.reports_root.join(run_id.to_string());
    if !options.dry_run {
        relationship_store
            .save(&table)
            .await
            .context("writing relationship table")?;
        let snapshot_dir = reports_dir.join("snapshots");
        let snapshot = export_relationships_parquet(
            &snapshot_dir.join("relationships.parquet"),
            table.rows(),
        )
        .context("exporting relationship snapshot")?;
        let manifest = serde_json::json!({
            "schema_version": 1,
            "files": [{
                "name": "relationships",
                "path": "relationships.parquet",
                "sha256": snapshot.sha256,
                "bytes": snapshot.bytes,
                "rows": snapshot.rows,
            }],
        });
        fs::write(
            snapshot_dir.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?,
        )
        .await
        .context("writing snapshot manifest")?;
    }

    let (cache_hits, cache_misses) = {
        let cache = cache.lock().await;
        (cache.hits(), cache.misses())
    };

    let finished_at = Utc::now();
    let summary = ResolveSummary {
        run_id,
        started_at,
        finished_at,
        scope: options.scope.clone(),
        profile: profile.name.clone(),
        dry_run: options.dry_run,
        facilities: outcome.records.len(),
        mentions,
        auto_accepted,
        review,
        pending: pending_count,
        inserted,
        updated,
        unchanged,
        cache_hits,
        cache_misses,
        relationships_total: table.len(),
        reports_dir: reports_dir.display().to_string(),
    };

    write_resolve_report(&reports_dir, &summary, &pendings).await?;
    info!(
        %run_id,
        auto = auto_accepted,
        review,
        pending = pending_count,
        "resolution run finished"
    );
    Ok(summary)
}

async fn write_resolve_report(
    reports_dir: &PathBuf,
    summary: &ResolveSummary,
    pendings: &[PendingMention],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief = format!(
        "# Resolution Brief\n\n- Run ID: `{}`\n- Profile: {}\n- Dry run: {}\n- Facilities: {}\n- Mentions: {}\n- Auto-accepted: {}\n- Review: {}\n- Pending: {}\n- Cache: {} hits / {} misses\n",
        summary.run_id,
        summary.profile,
        summary.dry_run,
        summary.facilities,
        summary.mentions,
        summary.auto_accepted,
        summary.review,
        summary.pending,
        summary.cache_hits,
        summary.cache_misses,
    );
    fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;

    let detail = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "pending": pendings,
    }))
    .context("serializing resolution report")?;
    fs::write(reports_dir.join("summary.json"), detail)
        .await
        .context("writing summary.json")?;
    Ok(())
}
