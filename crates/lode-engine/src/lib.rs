//! Dual entity-resolution engines over the facility corpus: duplicate
//! detection/merge and company mention resolution, plus their batch
//! pipelines.

pub mod dedup;
pub mod pipeline;
pub mod resolve;

pub const CRATE_NAME: &str = "lode-engine";

pub use dedup::{
    cascade_match, choose_survivor, completeness_score, default_cascade, merge_group,
    merge_records, plan_groups, DuplicateGroup, MatchStrategy, MatchStrategyKind,
};
pub use pipeline::{
    run_dedupe, run_resolve, DedupeOptions, DedupeSummary, ResolveOptions, ResolveSummary,
};
pub use resolve::{
    gate_for, resolve_mentions, score_mention, MentionResolution, ResolutionProfile, Shortlist,
};
