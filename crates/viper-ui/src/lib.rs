#![warn(missing_docs)]
//! # viper-ui
//!
//! ## Purpose
//! Defines the dashboard state model rendered by the VIPER monitor.
//!
//! ## Responsibilities
//! - Project the auth gate, feed snapshot, overlay view and history summary
//!   into display-ready values.
//! - Expose the guard deciding whether protected content may render.
//!
//! ## Data flow
//! Core crates publish snapshots -> `apply_*` reducers update
//! [`DashboardState`] -> the shell renders it.
//!
//! ## Ownership and lifetimes
//! `DashboardState` owns every string it shows so reducers never borrow from
//! short-lived snapshots.
//!
//! ## Error model
//! No recoverable errors; failures arrive as display text.
//!
//! ## Security and privacy notes
//! Dashboard state never holds credentials, tokens or session details beyond
//! the gate decision.

use viper_auth::{GateView, LOADING_MESSAGE};
use viper_core::{OverlayName, OverlayState};
use viper_feed::{FEED_UNAVAILABLE, FeedSnapshot};
use viper_history::HistorySummary;
use viper_overlay::OverlayView;

const NO_HISTORY: &str = "No detections yet";
const UNKNOWN_UPDATE: &str = "Unknown";

/// Gate projection for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAuthView {
    /// Neutral loading indicator.
    Loading,
    /// Login screen is being shown in place of protected content.
    RedirectToLogin,
    /// Protected content.
    Protected,
}

impl From<GateView> for UiAuthView {
    fn from(view: GateView) -> Self {
        match view {
            GateView::Loading => UiAuthView::Loading,
            GateView::RedirectToLogin { .. } => UiAuthView::RedirectToLogin,
            GateView::Protected => UiAuthView::Protected,
        }
    }
}

/// Feed badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedBadge {
    /// A frame arrived within the threshold.
    Live,
    /// No recent frame.
    Offline,
}

impl FeedBadge {
    /// Badge text.
    pub fn label(&self) -> &'static str {
        match self {
            FeedBadge::Live => "LIVE",
            FeedBadge::Offline => "OFFLINE",
        }
    }
}

/// Per-overlay control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    /// Overlay confirmed on.
    Active,
    /// Overlay confirmed off.
    Inactive,
    /// Toggle in flight.
    Loading,
}

impl ControlStatus {
    /// Status text.
    pub fn label(&self) -> &'static str {
        match self {
            ControlStatus::Active => "Active",
            ControlStatus::Inactive => "Inactive",
            ControlStatus::Loading => "Loading...",
        }
    }
}

/// One rendered overlay control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayControl {
    /// Overlay identity.
    pub name: OverlayName,
    /// Display title.
    pub title: &'static str,
    /// Subtitle.
    pub description: &'static str,
    /// Confirmed switch position.
    pub enabled: bool,
    /// Status text source.
    pub status: ControlStatus,
}

/// Aggregate dashboard state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardState {
    /// App version string sourced from root `VERSION`.
    pub version: String,
    /// Current gate view.
    pub auth: UiAuthView,
    /// Feed badge.
    pub feed: FeedBadge,
    /// Poller ticks so far.
    pub frame_count: u64,
    /// Feed error text, shown only while offline.
    pub feed_error: Option<String>,
    /// Confirmed overlay record.
    pub overlays: OverlayState,
    /// Overlays with a toggle in flight.
    pub loading: Vec<OverlayName>,
    /// Transient error banner.
    pub banner: Option<String>,
    /// Human-readable history status.
    pub history_status: String,
    /// "Last updated" text for the history table.
    pub last_updated: String,
}

impl DashboardState {
    /// Creates the pre-connection state.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            auth: UiAuthView::Loading,
            feed: FeedBadge::Offline,
            frame_count: 0,
            feed_error: None,
            overlays: OverlayState::default(),
            loading: Vec::new(),
            banner: None,
            history_status: NO_HISTORY.to_string(),
            last_updated: UNKNOWN_UPDATE.to_string(),
        }
    }

    /// Returns `true` when protected panels may render.
    pub fn can_view_protected(&self) -> bool {
        self.auth == UiAuthView::Protected
    }

    /// Loading text while the session is unresolved.
    pub fn auth_message(&self) -> Option<&'static str> {
        (self.auth == UiAuthView::Loading).then_some(LOADING_MESSAGE)
    }

    /// Applies a gate decision.
    ///
    /// Leaving the protected view clears the history panel.
    pub fn apply_gate(&mut self, view: GateView) {
        self.auth = view.into();
        if !self.can_view_protected() {
            self.history_status = NO_HISTORY.to_string();
            self.last_updated = UNKNOWN_UPDATE.to_string();
        }
    }

    /// Applies a feed snapshot.
    pub fn apply_feed(&mut self, snapshot: &FeedSnapshot) {
        self.feed = if snapshot.is_live {
            FeedBadge::Live
        } else {
            FeedBadge::Offline
        };
        self.frame_count = snapshot.frame_count;
        self.feed_error = match (self.feed, snapshot.last_error.as_deref()) {
            (FeedBadge::Offline, Some(_)) => Some(FEED_UNAVAILABLE.to_string()),
            _ => None,
        };
    }

    /// Applies an overlay view.
    pub fn apply_overlay(&mut self, view: &OverlayView) {
        self.overlays = view.confirmed;
        self.loading = OverlayName::ALL
            .into_iter()
            .filter(|name| view.is_loading(*name))
            .collect();
        self.banner = view.banner.clone();
    }

    /// Applies a history summary; ignored unless the gate is protected.
    pub fn apply_history(&mut self, summary: &HistorySummary) {
        if !self.can_view_protected() {
            return;
        }
        self.history_status = match summary.rows.len() {
            0 => NO_HISTORY.to_string(),
            total => format!(
                "{total} detections, {} high severity",
                summary.high_severity_count()
            ),
        };
        self.last_updated = summary.last_updated_text().to_string();
    }

    /// Controls in display order.
    pub fn overlay_controls(&self) -> Vec<OverlayControl> {
        OverlayName::ALL
            .into_iter()
            .map(|name| {
                let enabled = self.overlays.get(name);
                let status = if self.loading.contains(&name) {
                    ControlStatus::Loading
                } else if enabled {
                    ControlStatus::Active
                } else {
                    ControlStatus::Inactive
                };
                OverlayControl {
                    name,
                    title: name.label(),
                    description: name.description(),
                    enabled,
                    status,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for dashboard reducers.

    use super::*;
    use viper_overlay::PendingToggle;

    #[test]
    fn protected_panels_require_authenticated_gate() {
        let mut state = DashboardState::new("v0.1.0");
        assert!(!state.can_view_protected());
        assert_eq!(state.auth_message(), Some(LOADING_MESSAGE));

        state.apply_gate(GateView::Protected);
        assert!(state.can_view_protected());
        assert_eq!(state.auth_message(), None);
    }

    #[test]
    fn history_only_renders_behind_the_gate() {
        let summary = HistorySummary::from_records(&[viper_core::DetectionRecord {
            label: "Crack".to_string(),
            confidence: 95.0,
            time: "08:00:00".to_string(),
            date: "2025-03-02".to_string(),
            image: None,
        }])
        .expect("summary should build");

        let mut state = DashboardState::new("v0.1.0");
        state.apply_history(&summary);
        assert_eq!(state.history_status, NO_HISTORY);

        state.apply_gate(GateView::Protected);
        state.apply_history(&summary);
        assert_eq!(state.history_status, "1 detections, 1 high severity");
        assert_eq!(state.last_updated, "08:00:00");

        state.apply_gate(GateView::RedirectToLogin {
            route: viper_auth::LOGIN_ROUTE,
            replace_history: true,
        });
        assert_eq!(state.history_status, NO_HISTORY);
        assert_eq!(state.last_updated, UNKNOWN_UPDATE);
    }

    #[test]
    fn loading_control_shows_loading_status() {
        let mut state = DashboardState::new("v0.1.0");
        state.apply_overlay(&OverlayView {
            confirmed: OverlayState::default().with(OverlayName::Ai, true),
            pending: vec![PendingToggle {
                name: OverlayName::Gas,
                action: viper_core::OverlayAction::On,
                predicted: true,
            }],
            banner: None,
        });

        let statuses: Vec<&str> = state
            .overlay_controls()
            .iter()
            .map(|control| control.status.label())
            .collect();
        assert_eq!(statuses, vec!["Active", "Loading...", "Inactive"]);
    }

    #[test]
    fn feed_error_only_shows_while_offline() {
        let mut state = DashboardState::new("v0.1.0");
        state.apply_feed(&FeedSnapshot {
            is_live: false,
            frame_count: 7,
            last_error: Some("status 503".to_string()),
            last_success_at_ms: None,
        });
        assert_eq!(state.feed.label(), "OFFLINE");
        assert_eq!(state.feed_error.as_deref(), Some(FEED_UNAVAILABLE));

        state.apply_feed(&FeedSnapshot {
            is_live: true,
            frame_count: 8,
            last_error: None,
            last_success_at_ms: Some(1_200),
        });
        assert_eq!(state.feed.label(), "LIVE");
        assert_eq!(state.feed_error, None);
    }
}
