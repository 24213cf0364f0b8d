#![warn(missing_docs)]
//! # viper-feed
//!
//! ## Purpose
//! Polls the rig's frame endpoint and derives an online/offline status from
//! the recency of the last successful frame.
//!
//! ## Responsibilities
//! - Build cache-busted frame URLs on a fixed tick and count ticks.
//! - Record successful/failed loads into [`viper_core::FeedStatus`].
//! - Evaluate liveness on a separate, coarser tick ([`LivenessMonitor`]).
//! - Provide a backend-agnostic [`FrameSource`] with HTTP and synthetic
//!   implementations.
//! - Own the periodic timers as cancellable handles ([`PeriodicTask`]).
//!
//! ## Data flow
//! [`FeedMonitor`] ticks the [`FramePoller`] -> spawns a load through the
//! [`FrameSource`] (at most one in flight; ticks that find a load pending
//! only advance the counter) -> load outcome updates the poller -> the liveness tick
//! compares `now` against the last success -> [`FeedSnapshot`] is published
//! to subscribers.
//!
//! ## Ownership and lifetimes
//! Timers are owned by the monitor. Dropping the monitor (or a
//! [`PeriodicTask`]) cancels its ticks, and load results that arrive after
//! cancellation are discarded.
//!
//! ## Error model
//! Load failures are swallowed into the poller's error text and never reach
//! the caller; the next tick is the only retry. Invalid configuration is
//! reported as [`FeedError`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use viper_core::{FeedStatus, join_endpoint};

/// Default frame poll interval.
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 150;
/// Default liveness evaluation interval.
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 500;
/// Default staleness threshold after which the feed reads as offline.
pub const DEFAULT_LIVE_THRESHOLD_MS: u64 = 1_000;
/// Error text shown while frame loads fail.
pub const FEED_UNAVAILABLE: &str = "Camera feed unavailable";

/// Timing configuration for the poller and liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    frame_interval_ms: u64,
    liveness_interval_ms: u64,
    live_threshold_ms: u64,
}

impl FeedConfig {
    /// Creates validated feed timing.
    ///
    /// # Errors
    /// - [`FeedError::InvalidInterval`] when any interval is zero.
    /// - [`FeedError::ThresholdTooTight`] when the threshold does not exceed
    ///   the frame interval, or the liveness tick is slower than the threshold.
    pub fn new(
        frame_interval_ms: u64,
        liveness_interval_ms: u64,
        live_threshold_ms: u64,
    ) -> Result<Self, FeedError> {
        if frame_interval_ms == 0 || liveness_interval_ms == 0 {
            return Err(FeedError::InvalidInterval);
        }

        // Threshold must leave headroom for scheduling jitter on the poll tick.
        if live_threshold_ms <= frame_interval_ms {
            return Err(FeedError::ThresholdTooTight {
                threshold_ms: live_threshold_ms,
                interval_ms: frame_interval_ms,
            });
        }

        if liveness_interval_ms > live_threshold_ms {
            return Err(FeedError::ThresholdTooTight {
                threshold_ms: live_threshold_ms,
                interval_ms: liveness_interval_ms,
            });
        }

        Ok(Self {
            frame_interval_ms,
            liveness_interval_ms,
            live_threshold_ms,
        })
    }

    /// Frame poll period.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Liveness evaluation period.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Staleness threshold in milliseconds.
    pub fn live_threshold_ms(&self) -> u64 {
        self.live_threshold_ms
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            live_threshold_ms: DEFAULT_LIVE_THRESHOLD_MS,
        }
    }
}

/// Monotonic millisecond clock anchored at construction.
///
/// Uses tokio's clock so paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Starts a clock at zero.
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since [`MonotonicClock::start`].
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Wall-clock epoch milliseconds used as the `t` cache-busting parameter.
pub fn cache_bust_token() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Tick-driven frame poller state.
#[derive(Debug, Clone)]
pub struct FramePoller {
    frame_url: Url,
    current_url: Option<Url>,
    frame_count: u64,
    status: FeedStatus,
    last_error: Option<String>,
}

impl FramePoller {
    /// Creates a poller for `{server}/frame`.
    ///
    /// # Errors
    /// Returns [`FeedError::InvalidEndpoint`] when the frame URL cannot be
    /// derived from `server`.
    pub fn new(server: &Url) -> Result<Self, FeedError> {
        let frame_url = join_endpoint(server, "frame")
            .map_err(|error| FeedError::InvalidEndpoint(error.to_string()))?;

        Ok(Self {
            frame_url,
            current_url: None,
            frame_count: 0,
            status: FeedStatus::new(),
            last_error: None,
        })
    }

    /// Advances one tick and returns the URL to load.
    ///
    /// The frame counter is diagnostic only; it counts ticks, not successes.
    pub fn tick(&mut self, cache_bust: u64) -> Url {
        let mut url = self.frame_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("t", &cache_bust.to_string());

        self.frame_count = self.frame_count.saturating_add(1);
        self.current_url = Some(url.clone());
        url
    }

    /// URL issued on the most recent tick.
    pub fn current_frame_url(&self) -> Option<&Url> {
        self.current_url.as_ref()
    }

    /// Records a successful load at `now_ms` and clears the error text.
    pub fn on_frame_loaded(&mut self, now_ms: u64) {
        self.status.record_success(now_ms);
        self.last_error = None;
    }

    /// Records a failed load. Recency is left to age out.
    pub fn on_frame_error(&mut self) {
        self.last_error = Some(FEED_UNAVAILABLE.to_string());
    }

    /// Number of ticks issued so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Recency snapshot.
    pub fn status(&self) -> FeedStatus {
        self.status
    }

    /// Error text from the latest failed load, cleared by the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Published liveness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTransition {
    /// Published value did not change.
    Unchanged,
    /// Feed went from offline to live.
    WentLive,
    /// Feed went from live to offline.
    WentOffline,
}

/// Threshold-based liveness evaluator.
///
/// Holds only the last published value so transitions can be reported; the
/// value itself is always recomputed from [`FeedStatus`].
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    threshold_ms: u64,
    published_live: bool,
}

impl LivenessMonitor {
    /// Creates a monitor that starts offline.
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            threshold_ms,
            published_live: false,
        }
    }

    /// Re-evaluates liveness at `now_ms`.
    pub fn evaluate(&mut self, status: &FeedStatus, now_ms: u64) -> LivenessTransition {
        let live = status.is_live(now_ms, self.threshold_ms);
        self.publish(live)
    }

    /// Marks the feed live immediately after a recorded success.
    pub fn on_success(&mut self) -> LivenessTransition {
        self.publish(true)
    }

    /// Last published liveness.
    pub fn is_live(&self) -> bool {
        self.published_live
    }

    /// Configured staleness threshold.
    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }

    fn publish(&mut self, live: bool) -> LivenessTransition {
        let transition = match (self.published_live, live) {
            (false, true) => LivenessTransition::WentLive,
            (true, false) => LivenessTransition::WentOffline,
            _ => LivenessTransition::Unchanged,
        };
        self.published_live = live;
        transition
    }
}

/// Trait implemented by concrete frame providers.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Loads one frame from `url` and returns its bytes.
    ///
    /// # Errors
    /// Returns [`FeedError`] for transport failures, non-success status codes,
    /// and empty bodies.
    async fn load_frame(&self, url: &Url) -> Result<Vec<u8>, FeedError>;
}

/// HTTP frame source backed by `reqwest`.
///
/// Single-image responses are read whole. For `multipart/*` streams only the
/// first chunk is read, which is enough to prove the server is producing
/// frames, and the connection is released.
#[derive(Debug, Clone)]
pub struct HttpFrameSource {
    client: reqwest::Client,
}

impl HttpFrameSource {
    /// Creates an HTTP frame source with a per-request timeout.
    ///
    /// # Errors
    /// Returns [`FeedError::Transport`] when the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| FeedError::Transport(format!("http client build failed: {error}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn load_frame(&self, url: &Url) -> Result<Vec<u8>, FeedError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|error| FeedError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        let streaming = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("multipart/"));

        let body = if streaming {
            response
                .chunk()
                .await
                .map_err(|error| FeedError::Transport(error.to_string()))?
                .map(|chunk| chunk.to_vec())
                .unwrap_or_default()
        } else {
            response
                .bytes()
                .await
                .map_err(|error| FeedError::Transport(error.to_string()))?
                .to_vec()
        };

        if body.is_empty() {
            return Err(FeedError::EmptyFrame);
        }
        Ok(body)
    }
}

/// Deterministic frame source for tests and offline runs.
#[derive(Debug)]
pub struct SyntheticFrameSource {
    healthy: AtomicBool,
    loads: AtomicU64,
}

impl SyntheticFrameSource {
    /// Creates a healthy synthetic source.
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            loads: AtomicU64::new(0),
        }
    }

    /// Switches between serving frames and failing loads.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of load attempts seen.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn load_frame(&self, _url: &Url) -> Result<Vec<u8>, FeedError> {
        let sequence = self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(FeedError::Status(503));
        }

        // JPEG SOI marker followed by the sequence byte.
        Ok(vec![0xFF, 0xD8, (sequence % 255) as u8])
    }
}

/// Owned periodic timer that stops when cancelled or dropped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns `on_tick` every `period` until `token` is cancelled.
    ///
    /// The first tick fires immediately. Missed ticks are delayed, not burst.
    /// Must be called inside a tokio runtime; `period` must be non-zero.
    pub fn spawn<F>(
        name: &'static str,
        period: Duration,
        token: CancellationToken,
        mut on_tick: F,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => {
                        debug!(task = name, "periodic task stopped");
                        break;
                    }
                    _ = ticker.tick() => on_tick(),
                }
            }
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Requests cancellation without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the task and waits for its loop to exit.
    pub async fn join(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(error) = handle.await
        {
            warn!(task = self.name, %error, "periodic task ended abnormally");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Feed status projected for subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSnapshot {
    /// Derived liveness at publication time.
    pub is_live: bool,
    /// Ticks issued so far.
    pub frame_count: u64,
    /// Latest load error text, if the last load failed.
    pub last_error: Option<String>,
    /// Monotonic timestamp of the last success.
    pub last_success_at_ms: Option<u64>,
}

struct FeedShared {
    poller: Mutex<FramePoller>,
    liveness: Mutex<LivenessMonitor>,
    clock: MonotonicClock,
    snapshots: watch::Sender<FeedSnapshot>,
}

impl FeedShared {
    fn poller(&self) -> MutexGuard<'_, FramePoller> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn liveness(&self) -> MutexGuard<'_, LivenessMonitor> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> FeedSnapshot {
        let now_ms = self.clock.now_ms();
        let threshold_ms = self.liveness().threshold_ms();
        let poller = self.poller();
        let status = poller.status();

        FeedSnapshot {
            is_live: status.is_live(now_ms, threshold_ms),
            frame_count: poller.frame_count(),
            last_error: poller.last_error().map(str::to_string),
            last_success_at_ms: status.last_success_at_ms(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn apply_load(&self, result: Result<Vec<u8>, FeedError>) {
        match result {
            Ok(frame) => {
                let now_ms = self.clock.now_ms();
                self.poller().on_frame_loaded(now_ms);
                if self.liveness().on_success() == LivenessTransition::WentLive {
                    info!(frame_bytes = frame.len(), "frame feed is live");
                }
            }
            Err(error) => {
                debug!(%error, "frame load failed");
                self.poller().on_frame_error();
            }
        }
        self.publish();
    }

    fn evaluate_liveness(&self) {
        let now_ms = self.clock.now_ms();
        let status = self.poller().status();
        if self.liveness().evaluate(&status, now_ms) == LivenessTransition::WentOffline {
            warn!(
                staleness_ms = ?status.staleness_ms(now_ms),
                "frame feed went offline"
            );
        }
        self.publish();
    }
}

/// Running poller + liveness pair bound to one view activation.
pub struct FeedMonitor {
    shared: Arc<FeedShared>,
    scope: CancellationToken,
    poll_task: PeriodicTask,
    liveness_task: PeriodicTask,
}

impl FeedMonitor {
    /// Starts both timers against `{server}/frame`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns [`FeedError::InvalidEndpoint`] when the frame URL is invalid.
    pub fn start(
        config: FeedConfig,
        server: &Url,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self, FeedError> {
        let poller = FramePoller::new(server)?;
        let (snapshots, _) = watch::channel(FeedSnapshot::default());
        let shared = Arc::new(FeedShared {
            poller: Mutex::new(poller),
            liveness: Mutex::new(LivenessMonitor::new(config.live_threshold_ms())),
            clock: MonotonicClock::start(),
            snapshots,
        });
        let scope = CancellationToken::new();

        let poll_token = scope.child_token();
        let load_token = poll_token.clone();
        let poll_shared = Arc::clone(&shared);
        let mut in_flight: Option<JoinHandle<()>> = None;
        let poll_task = PeriodicTask::spawn(
            "frame-poller",
            config.frame_interval(),
            poll_token,
            move || {
                let url = poll_shared.poller().tick(cache_bust_token());
                if in_flight.as_ref().is_some_and(|load| !load.is_finished()) {
                    debug!(%url, "previous frame load still pending; skipping load");
                    return;
                }
                let shared = Arc::clone(&poll_shared);
                let source = Arc::clone(&source);
                let token = load_token.clone();
                in_flight = Some(tokio::spawn(async move {
                    let result = source.load_frame(&url).await;
                    if token.is_cancelled() {
                        debug!(%url, "dropping frame result after teardown");
                        return;
                    }
                    shared.apply_load(result);
                }));
            },
        );

        let liveness_shared = Arc::clone(&shared);
        let liveness_task = PeriodicTask::spawn(
            "liveness-monitor",
            config.liveness_interval(),
            scope.child_token(),
            move || liveness_shared.evaluate_liveness(),
        );

        info!(
            frame_interval_ms = config.frame_interval().as_millis() as u64,
            threshold_ms = config.live_threshold_ms(),
            "feed monitor started"
        );

        Ok(Self {
            shared,
            scope,
            poll_task,
            liveness_task,
        })
    }

    /// Current snapshot with liveness derived at call time.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.shared.snapshot()
    }

    /// Liveness derived at call time.
    pub fn is_live(&self) -> bool {
        self.snapshot().is_live
    }

    /// URL issued on the most recent poll tick.
    pub fn current_frame_url(&self) -> Option<Url> {
        self.shared.poller().current_frame_url().cloned()
    }

    /// Subscribes to published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Returns `true` until the monitor is stopped.
    pub fn is_running(&self) -> bool {
        !self.scope.is_cancelled()
    }

    /// Stops both timers and waits for them to exit.
    ///
    /// Loads already in flight complete but their results are discarded.
    pub async fn shutdown(self) {
        self.scope.cancel();
        self.poll_task.join().await;
        self.liveness_task.join().await;
        info!("feed monitor stopped");
    }
}

/// Feed layer error type.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Intervals must be positive.
    #[error("feed intervals must be greater than zero")]
    InvalidInterval,
    /// Threshold leaves no headroom over a tick interval.
    #[error("live threshold {threshold_ms}ms must exceed interval {interval_ms}ms")]
    ThresholdTooTight {
        /// Configured staleness threshold.
        threshold_ms: u64,
        /// Interval it was compared against.
        interval_ms: u64,
    },
    /// Frame endpoint cannot be derived from the server URL.
    #[error("invalid frame endpoint: {0}")]
    InvalidEndpoint(String),
    /// Network failure while loading a frame.
    #[error("frame transport failure: {0}")]
    Transport(String),
    /// Server answered with a non-success status.
    #[error("frame endpoint returned status {0}")]
    Status(u16),
    /// Server answered with an empty body.
    #[error("frame response was empty")]
    EmptyFrame,
}
