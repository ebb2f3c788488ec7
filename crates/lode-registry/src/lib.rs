//! Canonical-company registry seam: query trait, snapshot- and HTTP-backed
//! implementations, and the session-scoped lookup cache.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span};

use lode_core::blocking::{BlockKey, BlockingIndex};
use lode_core::similarity::normalize_name;
use lode_core::CanonicalCompany;

pub const CRATE_NAME: &str = "lode-registry";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry lookup timed out")]
    Timeout,
    #[error("registry returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("registry transport error: {message}")]
    Transport { message: String },
    #[error("decoding registry response: {message}")]
    Decode { message: String },
}

/// Read-only lookup into the canonical-company registry. The registry
/// itself is an external collaborator; implementations only shortlist.
#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    async fn query(
        &self,
        name: &str,
        country_hint: Option<&str>,
    ) -> Result<Vec<CanonicalCompany>, RegistryError>;
}

/// Registry backed by a local company snapshot file, shortlisted through a
/// name-token blocking index. Registered names and aliases all contribute
/// block keys; an empty token block falls back to a country-wide scan so
/// the shortlist never silently drops a same-country candidate.
#[derive(Debug, Clone)]
pub struct SnapshotRegistry {
    companies: Vec<CanonicalCompany>,
    index: BlockingIndex<usize>,
}

impl SnapshotRegistry {
    pub fn from_companies(companies: Vec<CanonicalCompany>) -> Self {
        let mut index = BlockingIndex::new();
        for (i, company) in companies.iter().enumerate() {
            let mut names = vec![company.registered_name.as_str()];
            names.extend(company.aliases.iter().map(String::as_str));
            let mut seen = Vec::new();
            for name in names {
                if let Some(key) = BlockKey::name_token(&company.country_code, name) {
                    if !seen.contains(&key) {
                        index.insert(key.clone(), i);
                        seen.push(key);
                    }
                }
            }
        }
        Self { companies, index }
    }

    /// Load a JSON array of companies from disk.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let companies: Vec<CanonicalCompany> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_companies(companies))
    }

    pub fn len(&self) -> usize {
        self.companies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.companies.is_empty()
    }

    fn shortlist(&self, name: &str, country_hint: Option<&str>) -> Vec<CanonicalCompany> {
        let mut indexes: Vec<usize> = Vec::new();
        let mut push = |i: usize, indexes: &mut Vec<usize>| {
            if !indexes.contains(&i) {
                indexes.push(i);
            }
        };

        match country_hint {
            Some(country) => {
                if let Some(key) = BlockKey::name_token(country, name) {
                    for &i in self.index.lookup(&key) {
                        push(i, &mut indexes);
                    }
                }
                if indexes.is_empty() {
                    for (i, company) in self.companies.iter().enumerate() {
                        if company.country_code.eq_ignore_ascii_case(country) {
                            push(i, &mut indexes);
                        }
                    }
                }
            }
            None => {
                // No hint: token match against every country, then full scan.
                let token = normalize_name(name)
                    .split_whitespace()
                    .next()
                    .map(str::to_string);
                if let Some(token) = token {
                    for (i, company) in self.companies.iter().enumerate() {
                        let mut names = vec![company.registered_name.clone()];
                        names.extend(company.aliases.iter().cloned());
                        if names.iter().any(|n| {
                            normalize_name(n)
                                .split_whitespace()
                                .next()
                                .map(|t| t == token)
                                .unwrap_or(false)
                        }) {
                            push(i, &mut indexes);
                        }
                    }
                }
                if indexes.is_empty() {
                    indexes.extend(0..self.companies.len());
                }
            }
        }

        indexes.into_iter().map(|i| self.companies[i].clone()).collect()
    }
}

#[async_trait]
impl CompanyRegistry for SnapshotRegistry {
    async fn query(
        &self,
        name: &str,
        country_hint: Option<&str>,
    ) -> Result<Vec<CanonicalCompany>, RegistryError> {
        Ok(self.shortlist(name, country_hint))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Small retry budget: a failed lookup degrades the mention, it never
/// blocks the batch, so two retries with backoff is the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl HttpRegistryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP registry client with bounded timeout and retry budget. Expects
/// `GET {base_url}/companies?name=..&country=..` returning a JSON array.
#[derive(Debug)]
pub struct HttpRegistry {
    client: reqwest::Client,
    config: HttpRegistryConfig,
}

impl HttpRegistry {
    pub fn new(config: HttpRegistryConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building registry http client")?;
        Ok(Self { client, config })
    }

    fn lookup_url(&self, name: &str, country_hint: Option<&str>) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = format!("{base}/companies?name={}", urlencode(name));
        if let Some(country) = country_hint {
            url.push_str(&format!("&country={}", urlencode(country)));
        }
        url
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl CompanyRegistry for HttpRegistry {
    async fn query(
        &self,
        name: &str,
        country_hint: Option<&str>,
    ) -> Result<Vec<CanonicalCompany>, RegistryError> {
        let url = self.lookup_url(name, country_hint);
        let span = info_span!("registry_query", name, country = country_hint.unwrap_or("-"));
        let _guard = span.enter();

        let mut last_error = RegistryError::Transport {
            message: "no attempt made".to_string(),
        };

        for attempt in 0..=self.config.backoff.max_retries {
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Vec<CanonicalCompany>>().await.map_err(|err| {
                            RegistryError::Decode {
                                message: err.to_string(),
                            }
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        last_error = RegistryError::HttpStatus {
                            status: status.as_u16(),
                        };
                        continue;
                    }
                    return Err(RegistryError::HttpStatus {
                        status: status.as_u16(),
                    });
                }
                Err(err) => {
                    let mapped = if err.is_timeout() {
                        RegistryError::Timeout
                    } else {
                        RegistryError::Transport {
                            message: err.to_string(),
                        }
                    };
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        last_error = mapped;
                        continue;
                    }
                    return Err(mapped);
                }
            }
        }

        Err(last_error)
    }
}

/// Session-scoped memo of registry lookups, keyed by normalized name +
/// country hint. Passed explicitly into the resolution run; never durable.
#[derive(Debug, Default)]
pub struct LookupCache {
    entries: HashMap<(String, String), Vec<CanonicalCompany>>,
    hits: usize,
    misses: usize,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, country_hint: Option<&str>) -> (String, String) {
        (
            normalize_name(name),
            country_hint.unwrap_or("").to_ascii_uppercase(),
        )
    }

    pub fn get(&mut self, name: &str, country_hint: Option<&str>) -> Option<Vec<CanonicalCompany>> {
        match self.entries.get(&Self::key(name, country_hint)) {
            Some(candidates) => {
                self.hits += 1;
                Some(candidates.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, name: &str, country_hint: Option<&str>, candidates: Vec<CanonicalCompany>) {
        self.entries.insert(Self::key(name, country_hint), candidates);
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache-through query. The cache stores empty shortlists too, so repeat
/// misses for the same raw name cost nothing.
pub async fn query_cached(
    registry: &dyn CompanyRegistry,
    cache: &mut LookupCache,
    name: &str,
    country_hint: Option<&str>,
) -> Result<Vec<CanonicalCompany>, RegistryError> {
    if let Some(hit) = cache.get(name, country_hint) {
        debug!(name, "registry cache hit");
        return Ok(hit);
    }
    let candidates = registry.query(name, country_hint).await?;
    cache.put(name, country_hint, candidates.clone());
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(id: &str, name: &str, country: &str, aliases: &[&str]) -> CanonicalCompany {
        CanonicalCompany {
            company_id: id.to_string(),
            registered_name: name.to_string(),
            country_code: country.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            registry_ids: vec![format!("reg-{id}")],
            parent_name: None,
        }
    }

    fn snapshot() -> SnapshotRegistry {
        SnapshotRegistry::from_companies(vec![
            company("cmp-bhp", "BHP Group Limited", "AUS", &["BHP", "BHP Billiton"]),
            company("cmp-implats", "Impala Platinum Holdings", "ZA", &["Implats"]),
            company("cmp-sibanye", "Sibanye Stillwater", "ZA", &[]),
        ])
    }

    #[tokio::test]
    async fn token_block_shortlists_by_registered_name_and_alias() {
        let registry = snapshot();
        let hits = registry.query("BHP", Some("AUS")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].company_id, "cmp-bhp");

        let hits = registry.query("Implats Rustenburg", Some("ZA")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].company_id, "cmp-implats");
    }

    #[tokio::test]
    async fn empty_token_block_falls_back_to_country_scan() {
        let registry = snapshot();
        let hits = registry.query("Stillwater Operations", Some("ZA")).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|c| c.company_id.as_str()).collect();
        assert!(ids.contains(&"cmp-implats"));
        assert!(ids.contains(&"cmp-sibanye"));
        assert!(!ids.contains(&"cmp-bhp"));
    }

    #[tokio::test]
    async fn missing_hint_matches_tokens_across_countries() {
        let registry = snapshot();
        let hits = registry.query("BHP", None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].company_id, "cmp-bhp");
    }

    #[tokio::test]
    async fn cache_counts_hits_and_serves_empty_shortlists() {
        let registry = snapshot();
        let mut cache = LookupCache::new();

        let first = query_cached(&registry, &mut cache, "Nonesuch Mining", Some("ZZ"))
            .await
            .unwrap();
        assert!(first.is_empty());
        let second = query_cached(&registry, &mut cache, "NONESUCH mining", Some("zz"))
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshot_loads_from_a_json_array_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.json");
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(&vec![company(
                "cmp-bhp",
                "BHP Group Limited",
                "AUS",
                &["BHP"],
            )])
            .unwrap(),
        )
        .unwrap();

        let registry = SnapshotRegistry::from_path(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(SnapshotRegistry::from_path(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_retries_server_side_failures() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn lookup_urls_are_escaped() {
        let registry = HttpRegistry::new(HttpRegistryConfig::new("https://registry.test/v1/"))
            .unwrap();
        let url = registry.lookup_url("Two Rivers & Co", Some("ZA"));
        assert_eq!(
            url,
            "https://registry.test/v1/companies?name=Two%20Rivers%20%26%20Co&country=ZA"
        );
    }
}
