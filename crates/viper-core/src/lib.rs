#![warn(missing_docs)]
//! # viper-core
//!
//! ## Purpose
//! Defines the pure data model shared across the `viper-ndt` workspace.
//!
//! ## Responsibilities
//! - Name the overlay flags exposed by the rig (`ai`, `gas`, `thermal`) and
//!   the `on`/`off` actions that mutate them.
//! - Represent the server-mirrored [`OverlayState`] record.
//! - Track feed recency in [`FeedStatus`] and derive liveness from it.
//! - Decode detection history records and classify their severity.
//!
//! ## Data flow
//! The overlay synchronizer decodes [`OverlayState`] from the remote toggle
//! endpoint, the feed poller records successes into [`FeedStatus`], and the
//! history client decodes [`DetectionRecord`] lists for manager views.
//!
//! ## Ownership and lifetimes
//! All records own their strings so snapshots can move between async tasks
//! without borrowing from transient network buffers.
//!
//! ## Error model
//! Unknown overlay names/actions and JSON failures return [`CoreError`].
//! Missing fields in remote payloads decode to defaults instead of failing.
//!
//! ## Example
//! ```rust
//! use viper_core::{FeedStatus, OverlayName, OverlayState};
//!
//! let state = OverlayState::from_json_bytes(br#"{"ai":false,"gas":true}"#).unwrap();
//! assert!(state.get(OverlayName::Gas));
//! assert!(!state.get(OverlayName::Thermal));
//!
//! let status = FeedStatus::new();
//! assert!(!status.is_live(10, 1_000));
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default camera/AI server base URL of the rig on the field network.
pub const DEFAULT_SERVER_URL: &str = "http://10.203.55.198:5001";

/// Label used for detection records that arrive without one.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// One named sensor-visualization toggle exposed by the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayName {
    /// Object detection boxes drawn by the AI server.
    Ai,
    /// Gas concentration readout.
    Gas,
    /// Thermal IR indicator.
    Thermal,
}

impl OverlayName {
    /// Every overlay in display order.
    pub const ALL: [OverlayName; 3] = [OverlayName::Ai, OverlayName::Gas, OverlayName::Thermal];

    /// Wire name used in URL paths and JSON keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayName::Ai => "ai",
            OverlayName::Gas => "gas",
            OverlayName::Thermal => "thermal",
        }
    }

    /// Human-readable control label.
    pub fn label(&self) -> &'static str {
        match self {
            OverlayName::Ai => "AI Detection",
            OverlayName::Gas => "Gas Sensor",
            OverlayName::Thermal => "Thermal IR",
        }
    }

    /// Short control description.
    pub fn description(&self) -> &'static str {
        match self {
            OverlayName::Ai => "Object detection & analysis",
            OverlayName::Gas => "Air quality monitoring",
            OverlayName::Thermal => "Heat signature detection",
        }
    }
}

impl fmt::Display for OverlayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayName {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ai" => Ok(OverlayName::Ai),
            "gas" => Ok(OverlayName::Gas),
            "thermal" => Ok(OverlayName::Thermal),
            _ => Err(CoreError::UnknownOverlay(raw.to_string())),
        }
    }
}

/// Requested overlay transition encoded in the toggle URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayAction {
    /// Enable the overlay.
    On,
    /// Disable the overlay.
    Off,
}

impl OverlayAction {
    /// Maps a desired flag value to its action.
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            OverlayAction::On
        } else {
            OverlayAction::Off
        }
    }

    /// Action that negates `current`.
    pub fn toggled_from(current: bool) -> Self {
        Self::from_enabled(!current)
    }

    /// Flag value this action requests.
    pub fn enabled(&self) -> bool {
        matches!(self, OverlayAction::On)
    }

    /// Wire name used in URL paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayAction::On => "on",
            OverlayAction::Off => "off",
        }
    }
}

impl fmt::Display for OverlayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayAction {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(OverlayAction::On),
            "off" => Ok(OverlayAction::Off),
            _ => Err(CoreError::UnknownAction(raw.to_string())),
        }
    }
}

/// Overlay flag record mirrored from the remote authority.
///
/// Absent JSON fields decode as `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlayState {
    /// AI detection overlay flag.
    #[serde(default)]
    pub ai: bool,
    /// Gas sensor overlay flag.
    #[serde(default)]
    pub gas: bool,
    /// Thermal overlay flag.
    #[serde(default)]
    pub thermal: bool,
}

impl OverlayState {
    /// Returns the flag value for `name`.
    pub fn get(&self, name: OverlayName) -> bool {
        match name {
            OverlayName::Ai => self.ai,
            OverlayName::Gas => self.gas,
            OverlayName::Thermal => self.thermal,
        }
    }

    /// Returns a copy with `name` set to `value`.
    pub fn with(mut self, name: OverlayName, value: bool) -> Self {
        match name {
            OverlayName::Ai => self.ai = value,
            OverlayName::Gas => self.gas = value,
            OverlayName::Thermal => self.thermal = value,
        }
        self
    }

    /// Names of all overlays currently enabled.
    pub fn enabled(&self) -> Vec<OverlayName> {
        OverlayName::ALL
            .into_iter()
            .filter(|name| self.get(*name))
            .collect()
    }

    /// Serializes state to compact JSON bytes.
    ///
    /// # Errors
    /// Returns [`CoreError::Codec`] when JSON serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(CoreError::Codec)
    }

    /// Deserializes state from JSON bytes.
    ///
    /// Unknown keys (for example an `error` field) are ignored.
    ///
    /// # Errors
    /// Returns [`CoreError::Codec`] when JSON decoding fails.
    pub fn from_json_bytes(raw: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(raw).map_err(CoreError::Codec)
    }
}

/// Recency record for the polled frame feed.
///
/// Liveness is never stored; it is always derived from the last success and
/// the caller's notion of `now`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStatus {
    last_success_at_ms: Option<u64>,
}

impl FeedStatus {
    /// Creates a status with no recorded success.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful frame load at `now_ms`.
    pub fn record_success(&mut self, now_ms: u64) {
        self.last_success_at_ms = Some(match self.last_success_at_ms {
            Some(previous) => previous.max(now_ms),
            None => now_ms,
        });
    }

    /// Timestamp of the most recent successful load, if any.
    pub fn last_success_at_ms(&self) -> Option<u64> {
        self.last_success_at_ms
    }

    /// Milliseconds since the last success, or `None` before the first one.
    pub fn staleness_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_success_at_ms
            .map(|last| now_ms.saturating_sub(last))
    }

    /// Returns `true` when the last success is younger than `threshold_ms`.
    ///
    /// Always `false` before any success has been recorded.
    pub fn is_live(&self, now_ms: u64, threshold_ms: u64) -> bool {
        self.staleness_ms(now_ms)
            .is_some_and(|staleness| staleness < threshold_ms)
    }
}

/// Detection severity derived from confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Confidence at or below 70.
    Low,
    /// Confidence above 70 and at most 85.
    Medium,
    /// Confidence above 85.
    High,
}

impl Severity {
    /// Classifies a confidence score in `[0, 100]`.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 85.0 {
            Severity::High
        } else if confidence > 70.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Lowercase wire/display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detection event recorded by the AI server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Detected class label.
    #[serde(default = "unknown_label")]
    pub label: String,
    /// Confidence score in `[0, 100]`.
    #[serde(default)]
    pub confidence: f64,
    /// Wall-clock time of the detection as reported by the server.
    #[serde(default)]
    pub time: String,
    /// Calendar date of the detection as reported by the server.
    #[serde(default)]
    pub date: String,
    /// Snapshot image file name stored next to the mission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl DetectionRecord {
    /// Severity bucket for this record.
    pub fn severity(&self) -> Severity {
        Severity::from_confidence(self.confidence)
    }
}

/// Resolves `path` against the server base URL.
///
/// The base is treated as a directory, so `http://rig:5001/viper` joined with
/// `overlay` yields `http://rig:5001/viper/overlay`. Query and fragment of the
/// base are discarded.
///
/// # Errors
/// Returns [`CoreError::InvalidEndpoint`] when the base cannot carry a path
/// (for example `data:` URLs) or the join fails.
pub fn join_endpoint(server: &Url, path: &str) -> Result<Url, CoreError> {
    if server.cannot_be_a_base() {
        return Err(CoreError::InvalidEndpoint(format!(
            "server url cannot be a base: {server}"
        )));
    }

    let mut base = server.clone();
    base.set_query(None);
    base.set_fragment(None);
    if !base.path().ends_with('/') {
        let directory = format!("{}/", base.path());
        base.set_path(&directory);
    }

    base.join(path.trim_start_matches('/'))
        .map_err(|error| CoreError::InvalidEndpoint(format!("cannot join {path}: {error}")))
}

fn unknown_label() -> String {
    UNKNOWN_LABEL.to_string()
}

/// Error type for core model parsing and codec failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Overlay name is outside `{ai, gas, thermal}`.
    #[error("unknown overlay: {0}")]
    UnknownOverlay(String),
    /// Overlay action is neither `on` nor `off`.
    #[error("unknown overlay action: {0}")]
    UnknownAction(String),
    /// Server URL cannot produce the requested endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// JSON encoding/decoding error.
    #[error("payload codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_status_is_offline_before_first_success() {
        let status = FeedStatus::new();
        assert!(!status.is_live(0, 1_000));
        assert_eq!(status.staleness_ms(5_000), None);
    }

    #[test]
    fn feed_status_ages_out_at_threshold() {
        let mut status = FeedStatus::new();
        status.record_success(100);
        assert!(status.is_live(1_099, 1_000));
        assert!(!status.is_live(1_100, 1_000));
    }

    #[test]
    fn late_success_does_not_move_recency_backwards() {
        let mut status = FeedStatus::new();
        status.record_success(500);
        status.record_success(300);
        assert_eq!(status.last_success_at_ms(), Some(500));
    }

    #[test]
    fn join_endpoint_treats_base_as_directory() {
        let server = Url::parse("http://rig.local:5001/viper?x=1").unwrap();
        let joined = join_endpoint(&server, "/overlay").unwrap();
        assert_eq!(joined.as_str(), "http://rig.local:5001/viper/overlay");

        let bare = Url::parse("http://rig.local:5001").unwrap();
        assert_eq!(
            join_endpoint(&bare, "api/history").unwrap().as_str(),
            "http://rig.local:5001/api/history"
        );
    }

    #[test]
    fn overlay_names_parse_case_insensitively() {
        assert_eq!("Thermal".parse::<OverlayName>().unwrap(), OverlayName::Thermal);
        assert!(matches!(
            "lidar".parse::<OverlayName>(),
            Err(CoreError::UnknownOverlay(_))
        ));
    }
}
