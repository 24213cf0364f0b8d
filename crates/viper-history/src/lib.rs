#![warn(missing_docs)]
//! # viper-history
//!
//! ## Purpose
//! Reads the AI server's detection history and the realtime database mission
//! logs, and projects them into rows the dashboard can list and filter.
//!
//! ## Responsibilities
//! - Parse `GET {server}/api/history` payloads, tolerating empty bodies.
//! - Project records newest-first with 1-based ids, rounded confidence and
//!   severity buckets.
//! - Search/filter rows and summarize them (last updated, per-label counts).
//! - Digest the canonical history so unchanged polls skip re-projection.
//! - Flatten `missions/{missionId}/{entryId}` snapshots newest-first and
//!   poll them with the signed-in user's id token ([`MissionPoller`]).
//!
//! ## Data flow
//! Raw bytes -> [`parse_history`] -> [`history_digest`] gate ->
//! [`project_rows`] -> [`filter_rows`] / [`HistorySummary`].
//!
//! ## Error model
//! Invalid JSON returns [`HistoryError::Decode`]; transport problems return
//! [`HistoryError::Transport`] or [`HistoryError::Status`]. Callers keep the
//! previous projection on error.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use viper_core::{DetectionRecord, Severity, UNKNOWN_LABEL, join_endpoint};

/// Default history poll period.
pub const DEFAULT_HISTORY_INTERVAL_MS: u64 = 10_000;
/// Time shown for records the server sent without one.
pub const DEFAULT_ROW_TIME: &str = "00:00:00";
/// Realtime database path holding mission logs.
pub const MISSIONS_PATH: &str = "missions";

/// Parses a history payload.
///
/// Empty bodies and `null` are an empty history.
///
/// # Errors
/// Returns [`HistoryError::Decode`] when the body is not a JSON array of
/// detection records.
pub fn parse_history(raw: &[u8]) -> Result<Vec<DetectionRecord>, HistoryError> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: Option<Vec<DetectionRecord>> =
        serde_json::from_slice(trimmed).map_err(HistoryError::Decode)?;
    Ok(parsed.unwrap_or_default())
}

/// Lowercase hex SHA-256 of the canonical JSON encoding of `records`.
///
/// # Errors
/// Returns [`HistoryError::Decode`] if encoding fails.
pub fn history_digest(records: &[DetectionRecord]) -> Result<String, HistoryError> {
    let canonical = serde_json::to_vec(records).map_err(HistoryError::Decode)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// One listed detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionRow {
    /// 1-based position in server order, so the oldest record is `1`.
    pub id: usize,
    /// Detected class label.
    pub label: String,
    /// Detection time, or [`DEFAULT_ROW_TIME`].
    pub time: String,
    /// Detection date; may be empty.
    pub date: String,
    /// Severity bucket.
    pub severity: Severity,
    /// Confidence rounded to a whole percent.
    pub confidence: u8,
    /// Snapshot image file name.
    pub image: Option<String>,
}

/// Projects server-ordered records into newest-first rows.
pub fn project_rows(records: &[DetectionRecord]) -> Vec<DetectionRow> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| DetectionRow {
            id: index + 1,
            label: if record.label.trim().is_empty() {
                UNKNOWN_LABEL.to_string()
            } else {
                record.label.clone()
            },
            time: if record.time.is_empty() {
                DEFAULT_ROW_TIME.to_string()
            } else {
                record.time.clone()
            },
            date: record.date.clone(),
            severity: record.severity(),
            confidence: round_confidence(record.confidence),
            image: record.image.clone(),
        })
        .rev()
        .collect()
}

fn round_confidence(confidence: f64) -> u8 {
    if confidence.is_nan() {
        return 0;
    }
    // Clamped first, so the cast cannot truncate.
    confidence.round().clamp(0.0, 100.0) as u8
}

/// Severity filter chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeverityFilter {
    /// Every severity.
    #[default]
    All,
    /// One severity bucket.
    Only(Severity),
}

impl SeverityFilter {
    /// Filter chips in display order.
    pub const CHOICES: [SeverityFilter; 4] = [
        SeverityFilter::All,
        SeverityFilter::Only(Severity::High),
        SeverityFilter::Only(Severity::Medium),
        SeverityFilter::Only(Severity::Low),
    ];

    /// Returns `true` when `severity` passes the filter.
    pub fn matches(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::All => true,
            SeverityFilter::Only(expected) => *expected == severity,
        }
    }
}

impl fmt::Display for SeverityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeverityFilter::All => f.write_str("all"),
            SeverityFilter::Only(severity) => f.write_str(severity.as_str()),
        }
    }
}

impl FromStr for SeverityFilter {
    type Err = HistoryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(SeverityFilter::All),
            "high" => Ok(SeverityFilter::Only(Severity::High)),
            "medium" => Ok(SeverityFilter::Only(Severity::Medium)),
            "low" => Ok(SeverityFilter::Only(Severity::Low)),
            _ => Err(HistoryError::UnknownFilter(raw.to_string())),
        }
    }
}

/// Keeps rows whose label contains `search` (case-insensitive) and whose
/// severity passes `filter`.
pub fn filter_rows<'a>(
    rows: &'a [DetectionRow],
    search: &str,
    filter: SeverityFilter,
) -> Vec<&'a DetectionRow> {
    let needle = search.trim().to_lowercase();
    rows.iter()
        .filter(|row| filter.matches(row.severity))
        .filter(|row| needle.is_empty() || row.label.to_lowercase().contains(&needle))
        .collect()
}

/// Time of the newest record, if the history is non-empty.
pub fn last_updated(records: &[DetectionRecord]) -> Option<String> {
    records.last().map(|record| {
        if record.time.is_empty() {
            UNKNOWN_LABEL.to_string()
        } else {
            record.time.clone()
        }
    })
}

/// Detection counts per label.
pub fn label_counts(rows: &[DetectionRow]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        *counts.entry(row.label.clone()).or_insert(0) += 1;
    }
    counts
}

/// Aggregate view of one history snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistorySummary {
    /// Newest-first rows.
    pub rows: Vec<DetectionRow>,
    /// Time of the newest record.
    pub last_updated: Option<String>,
    /// Per-label counts.
    pub label_counts: BTreeMap<String, usize>,
    /// Digest of the records this summary was built from.
    pub digest: String,
}

impl HistorySummary {
    /// Builds a summary from server-ordered records.
    ///
    /// # Errors
    /// Propagates [`history_digest`] failures.
    pub fn from_records(records: &[DetectionRecord]) -> Result<Self, HistoryError> {
        let rows = project_rows(records);
        let label_counts = label_counts(&rows);
        Ok(Self {
            last_updated: last_updated(records),
            label_counts,
            digest: history_digest(records)?,
            rows,
        })
    }

    /// Number of high-severity rows.
    pub fn high_severity_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| row.severity == Severity::High)
            .count()
    }

    /// "Last updated" display text.
    pub fn last_updated_text(&self) -> &str {
        self.last_updated.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// One flattened mission log record.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionLogEntry {
    /// Key under `missions/`.
    pub mission_id: String,
    /// Key under the mission.
    pub entry_id: String,
    /// Raw record, passed through unchanged.
    pub record: Value,
}

/// Flattens a `missions/` snapshot newest-first.
///
/// Keys are visited in lexicographic order. Realtime database push ids sort
/// chronologically, so reversing that walk lists the newest entry first.
/// `null` and non-object snapshots flatten to nothing; non-object missions
/// are skipped.
pub fn flatten_mission_logs(snapshot: &Value) -> Vec<MissionLogEntry> {
    let Some(missions) = snapshot.as_object() else {
        return Vec::new();
    };

    let mut entries: Vec<MissionLogEntry> = sorted_entries(missions)
        .into_iter()
        .filter_map(|(mission_id, mission)| {
            mission.as_object().map(|records| (mission_id, records))
        })
        .flat_map(|(mission_id, records)| {
            sorted_entries(records)
                .into_iter()
                .map(move |(entry_id, record)| MissionLogEntry {
                    mission_id: mission_id.clone(),
                    entry_id: entry_id.clone(),
                    record: record.clone(),
                })
        })
        .collect();
    entries.reverse();
    entries
}

fn sorted_entries(map: &serde_json::Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|left, right| left.0.cmp(right.0));
    entries
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            sorted_entries(map)
                .into_iter()
                .map(|(key, nested)| (key.clone(), canonical(nested)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Source of raw detection history bytes.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetches the current history body.
    async fn fetch_history(&self) -> Result<Vec<u8>, HistoryError>;
}

/// Source of realtime database mission snapshots.
#[async_trait]
pub trait MissionSource: Send + Sync {
    /// Fetches the current `missions/` snapshot, authorized by `id_token`
    /// when one is given.
    async fn fetch_missions(&self, id_token: Option<&str>) -> Result<Value, HistoryError>;
}

/// HTTP history source for `{server}/api/history`.
pub struct HttpHistorySource {
    client: reqwest::Client,
    history_url: Url,
}

impl HttpHistorySource {
    /// Creates a source for `server`.
    ///
    /// # Errors
    /// Returns [`HistoryError::InvalidEndpoint`] or [`HistoryError::Transport`].
    pub fn new(server: &Url, timeout: Duration) -> Result<Self, HistoryError> {
        let history_url = join_endpoint(server, "api/history")
            .map_err(|error| HistoryError::InvalidEndpoint(error.to_string()))?;
        Ok(Self {
            client: build_client(timeout)?,
            history_url,
        })
    }

    /// History endpoint URL.
    pub fn history_url(&self) -> &Url {
        &self.history_url
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_history(&self) -> Result<Vec<u8>, HistoryError> {
        get_bytes(&self.client, &self.history_url).await
    }
}

/// Realtime database REST source for `{database}/missions.json`.
pub struct HttpMissionSource {
    client: reqwest::Client,
    missions_url: Url,
}

impl HttpMissionSource {
    /// Creates a source rooted at the realtime database URL.
    ///
    /// # Errors
    /// Returns [`HistoryError::InvalidEndpoint`] or [`HistoryError::Transport`].
    pub fn new(database: &Url, timeout: Duration) -> Result<Self, HistoryError> {
        let missions_url = join_endpoint(database, &format!("{MISSIONS_PATH}.json"))
            .map_err(|error| HistoryError::InvalidEndpoint(error.to_string()))?;
        Ok(Self {
            client: build_client(timeout)?,
            missions_url,
        })
    }

    /// Snapshot endpoint URL.
    pub fn missions_url(&self) -> &Url {
        &self.missions_url
    }
}

#[async_trait]
impl MissionSource for HttpMissionSource {
    async fn fetch_missions(&self, id_token: Option<&str>) -> Result<Value, HistoryError> {
        let mut url = self.missions_url.clone();
        if let Some(token) = id_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        let body = get_bytes(&self.client, &url).await?;
        if body.trim_ascii().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(HistoryError::Decode)
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, HistoryError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| HistoryError::Transport(format!("http client build failed: {error}")))
}

async fn get_bytes(client: &reqwest::Client, url: &Url) -> Result<Vec<u8>, HistoryError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|error| HistoryError::Transport(error.without_url().to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(HistoryError::Status(status.as_u16()));
    }
    let body = response
        .bytes()
        .await
        .map_err(|error| HistoryError::Transport(error.without_url().to_string()))?;
    Ok(body.to_vec())
}

/// Result of one digest-gated poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T = HistorySummary> {
    /// Snapshot changed; carries the new projection.
    Updated(T),
    /// Digest matched the previous poll.
    Unchanged,
}

/// Polls a [`HistorySource`] and re-projects only when the digest changes.
pub struct HistoryPoller {
    source: Arc<dyn HistorySource>,
    last_digest: Option<String>,
}

impl HistoryPoller {
    /// Creates a poller that has seen nothing yet.
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self {
            source,
            last_digest: None,
        }
    }

    /// Digest of the last projected history.
    pub fn last_digest(&self) -> Option<&str> {
        self.last_digest.as_deref()
    }

    /// Forgets the last digest so the next poll always projects.
    pub fn reset(&mut self) {
        self.last_digest = None;
    }

    /// Fetches once.
    ///
    /// # Errors
    /// Source and decode failures are returned; the previous digest is kept
    /// so the next successful poll compares against the last good snapshot.
    pub async fn poll(&mut self) -> Result<PollOutcome, HistoryError> {
        let body = self.source.fetch_history().await.inspect_err(|error| {
            warn!(%error, "history fetch failed");
        })?;
        let records = parse_history(&body)?;
        let digest = history_digest(&records)?;

        if self.last_digest.as_deref() == Some(digest.as_str()) {
            debug!(%digest, "history unchanged");
            return Ok(PollOutcome::Unchanged);
        }

        let summary = HistorySummary::from_records(&records)?;
        info!(records = records.len(), %digest, "history updated");
        self.last_digest = Some(digest);
        Ok(PollOutcome::Updated(summary))
    }
}

/// Lowercase hex SHA-256 of a realtime database snapshot.
///
/// Object keys are sorted before hashing, so equal snapshots digest equally.
///
/// # Errors
/// Returns [`HistoryError::Decode`] if encoding fails.
pub fn mission_digest(snapshot: &Value) -> Result<String, HistoryError> {
    let canonical = serde_json::to_vec(&canonical(snapshot)).map_err(HistoryError::Decode)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Polls a [`MissionSource`] and re-flattens only when the snapshot changes.
pub struct MissionPoller {
    source: Arc<dyn MissionSource>,
    last_digest: Option<String>,
}

impl MissionPoller {
    /// Creates a poller that has seen nothing yet.
    pub fn new(source: Arc<dyn MissionSource>) -> Self {
        Self {
            source,
            last_digest: None,
        }
    }

    /// Forgets the last digest so the next poll always delivers.
    pub fn reset(&mut self) {
        self.last_digest = None;
    }

    /// Fetches once with `id_token`.
    ///
    /// # Errors
    /// Source and decode failures are returned and the previous digest is
    /// kept.
    pub async fn poll(
        &mut self,
        id_token: Option<&str>,
    ) -> Result<PollOutcome<Vec<MissionLogEntry>>, HistoryError> {
        let snapshot = self.source.fetch_missions(id_token).await.inspect_err(|error| {
            warn!(%error, "mission snapshot fetch failed");
        })?;
        let digest = mission_digest(&snapshot)?;

        if self.last_digest.as_deref() == Some(digest.as_str()) {
            debug!(%digest, "mission snapshot unchanged");
            return Ok(PollOutcome::Unchanged);
        }

        let entries = flatten_mission_logs(&snapshot);
        info!(entries = entries.len(), %digest, "mission snapshot updated");
        self.last_digest = Some(digest);
        Ok(PollOutcome::Updated(entries))
    }
}

/// History errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Body is not valid history JSON.
    #[error("history decode failure: {0}")]
    Decode(#[source] serde_json::Error),
    /// Network failure.
    #[error("history transport failure: {0}")]
    Transport(String),
    /// Non-success HTTP status.
    #[error("history endpoint returned status {0}")]
    Status(u16),
    /// Endpoint cannot be derived.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// Filter name outside `all|high|medium|low`.
    #[error("unknown severity filter: {0}")]
    UnknownFilter(String),
}
