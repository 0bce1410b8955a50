//! Rebuild orchestrator.
//!
//! A rebuild tears the circuit engine down and brings a fresh one up with the
//! current targets. At most one rebuild runs at a time; requests that arrive
//! while one is running collapse into a single pending slot that is honored
//! shortly after the running rebuild finishes.
//!
//! # States
//!
//! ```text
//!            request(reason)
//!   ┌──────┐ ──────────────────▶ ┌────────────┐
//!   │ Idle │                     │ Rebuilding │ ◀── request(other): pending = other
//!   └──────┘ ◀────────────────── └────────────┘     (returns Queued at once)
//!              done, nothing          │     ▲
//!              pending                │     │ 100 ms later: run pending
//!                                     ▼     │
//!                                ┌────────────┐
//!                                │  Handoff   │ ◀── request(other): pending = other
//!                                └────────────┘
//! ```
//!
//! Busy stays set through the handoff, so only the latest pending reason runs.
//!
//! # Rebuild Sequence
//!
//! | Step | Action | On failure |
//! |------|--------|------------|
//! | 1 | Stop the rotation timer | - |
//! | 2 | Shut the current engine down | logged |
//! | 3 | `SIGNAL NEWNYM` | logged |
//! | 4 | `CLOSECIRCUIT` every generic circuit | logged per circuit |
//! | 5 | Refresh the relay directory | logged |
//! | 6 | Build and initialize a new engine | rebuild fails |
//! | 7 | Run one circuit cache cycle | folded into the cycle |
//! | 8 | Re-arm the rotation timer | - |
//!
//! Step 8 runs after failed rebuilds too, so a rotation that fails still
//! schedules the next one.
//!
//! # Rotation
//!
//! When enabled, the next automatic rebuild fires after the base interval
//! plus a uniform jitter of up to `variance_percent` of it either way. The
//! jitter is drawn again on every reschedule. The interval is at least 60 s,
//! the variance at most 80 %, and no delay is shorter than 30 s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::circuit::now_epoch_secs;
use crate::config::{Config, LogLevel, RotationSettings};
use crate::control::{ControlChannel, DEFAULT_COMMAND_TIMEOUT};
use crate::engine::{build_targets, normalize_hop_count, CircuitTarget, EngineFactory};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::pipeline::CircuitCache;

/// Deadline for `SIGNAL NEWNYM`.
pub const NEWNYM_TIMEOUT: Duration = Duration::from_secs(6);

/// Delay before a pending reason is re-issued.
pub const REQUEUE_DELAY: Duration = Duration::from_millis(100);

/// Smallest accepted base rotation interval, in seconds.
pub const MIN_ROTATION_INTERVAL_SECS: u64 = 60;

/// Largest accepted rotation jitter, in percent.
pub const MAX_ROTATION_VARIANCE_PERCENT: u8 = 80;

/// Floor for any computed rotation delay.
pub const MIN_ROTATION_DELAY: Duration = Duration::from_secs(30);

/// Reason used by the rotation timer.
pub const ROTATION_REASON: &str = "rotation";

/// Result of a rebuild request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The rebuild ran to completion.
    Completed {
        /// Reason the rebuild was requested with.
        reason: String,
    },
    /// Another rebuild was running; the reason now occupies the pending slot.
    Queued,
    /// Prerequisites are not met; nothing happened.
    NotReady,
    /// The rebuild ran and failed.
    Failed(String),
}

impl RebuildOutcome {
    /// Returns `true` for [`RebuildOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, RebuildOutcome::Completed { .. })
    }

    /// Short machine-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            RebuildOutcome::Completed { .. } => "completed",
            RebuildOutcome::Queued => "rebuild_in_progress",
            RebuildOutcome::NotReady => "not_ready",
            RebuildOutcome::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for RebuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebuildOutcome::Completed { reason } => write!(f, "completed ({})", reason),
            RebuildOutcome::Failed(message) => write!(f, "failed: {}", message),
            other => f.write_str(other.label()),
        }
    }
}

/// Live rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RotationConfig {
    /// Whether the timer is armed.
    pub enabled: bool,
    /// Base interval, seconds.
    pub interval_secs: u64,
    /// Jitter, percent of the base interval.
    pub variance_percent: u8,
    /// When the timer fires next, epoch seconds. Zero when not armed.
    pub next_fire_ts: u64,
}

impl RotationConfig {
    /// Builds a configuration with the interval and variance clamped.
    ///
    /// ```rust
    /// use circuit_sidecar::orchestrator::RotationConfig;
    ///
    /// let rotation = RotationConfig::clamped(true, 5, 200);
    /// assert_eq!(rotation.interval_secs, 60);
    /// assert_eq!(rotation.variance_percent, 80);
    /// assert_eq!(rotation.next_fire_ts, 0);
    /// ```
    pub fn clamped(enabled: bool, interval_secs: u64, variance_percent: u8) -> Self {
        Self {
            enabled,
            interval_secs: interval_secs.max(MIN_ROTATION_INTERVAL_SECS),
            variance_percent: variance_percent.min(MAX_ROTATION_VARIANCE_PERCENT),
            next_fire_ts: 0,
        }
    }
}

impl From<&RotationSettings> for RotationConfig {
    fn from(settings: &RotationSettings) -> Self {
        Self::clamped(
            settings.enabled,
            settings.interval_secs,
            settings.variance_percent,
        )
    }
}

/// Draws the delay until the next rotation.
pub fn rotation_delay<R: Rng + ?Sized>(
    rng: &mut R,
    interval_secs: u64,
    variance_percent: u8,
) -> Duration {
    let base_ms = interval_secs.max(MIN_ROTATION_INTERVAL_SECS) as f64 * 1000.0;
    let variance = f64::from(variance_percent.min(MAX_ROTATION_VARIANCE_PERCENT)) / 100.0;
    let jitter = base_ms * variance;
    let offset = if jitter > 0.0 {
        rng.gen_range(-jitter..=jitter)
    } else {
        0.0
    };
    let floor_ms = MIN_ROTATION_DELAY.as_millis() as f64;
    Duration::from_millis((base_ms + offset).round().max(floor_ms) as u64)
}

/// What new engines are built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSettings {
    /// Target hosts; empty means the built-in probe hosts.
    pub addresses: Vec<String>,
    /// Path length, 2 or 3.
    pub hop_count: u8,
    /// Lower-case exit countries; empty means AUTO.
    pub exit_countries: Vec<String>,
    /// Circuits per target, at least.
    pub min_circuits: u32,
    /// Circuits per target, at most.
    pub max_circuits: u32,
}

impl TargetSettings {
    /// Takes the startup defaults from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            addresses: config.targets.clone(),
            hop_count: normalize_hop_count(config.hop_count),
            exit_countries: config
                .exit_countries
                .iter()
                .map(|cc| cc.to_ascii_lowercase())
                .collect(),
            min_circuits: config.min_circuits,
            max_circuits: config.max_circuits,
        }
    }

    /// Expands the settings into engine targets.
    pub fn build(&self, available: &[String]) -> Vec<CircuitTarget> {
        build_targets(
            &self.addresses,
            self.hop_count,
            &self.exit_countries,
            available,
            self.min_circuits,
            self.max_circuits,
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ends a rebuild. With a reason pending, the busy flag stays set and the
/// pending slot is handed to the worker; otherwise the flag is cleared.
struct RebuildGuard<'a>(&'a Orchestrator);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        let pending = lock(&self.0.pending);
        match pending.as_deref() {
            Some(reason) => {
                plog(
                    LogLevel::Info,
                    &format!("Queued rebuild reason={} runs next", reason),
                );
                self.0.send_after(Scheduled::Pending, self.0.requeue_delay);
            }
            None => self.0.busy.store(false, Ordering::SeqCst),
        }
    }
}

/// Work handed to the request worker.
#[derive(Debug)]
enum Scheduled {
    /// A fresh request for this reason.
    Request(String),
    /// Run whatever reason holds the pending slot; busy is already held.
    Pending,
}

/// Serializes rebuilds and drives the rotation timer.
pub struct Orchestrator {
    cache: Arc<CircuitCache>,
    channel: ControlChannel,
    factory: Arc<dyn EngineFactory>,
    targets: Mutex<TargetSettings>,
    rotation: Mutex<RotationConfig>,
    rotation_timer: Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
    busy: AtomicBool,
    pending: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    last_reason: Mutex<Option<String>>,
    requests: mpsc::UnboundedSender<Scheduled>,
    worker: AbortHandle,
    requeue_delay: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("ready", &self.is_ready())
            .field("busy", &self.is_busy())
            .field("rotation", &self.rotation())
            .field("last_error", &self.last_error())
            .finish()
    }
}

/// Issues scheduled work, each item on its own task.
async fn run_requests(
    orchestrator: Weak<Orchestrator>,
    mut rx: mpsc::UnboundedReceiver<Scheduled>,
) {
    while let Some(work) = rx.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            match work {
                Scheduled::Request(reason) => {
                    let outcome = orchestrator.request(&reason).await;
                    plog(
                        LogLevel::Debug,
                        &format!("Scheduled rebuild reason={}: {}", reason, outcome),
                    );
                }
                Scheduled::Pending => orchestrator.run_pending().await,
            }
        });
    }
}

impl Orchestrator {
    /// Creates an orchestrator and its request worker.
    ///
    /// Must be called inside a Tokio runtime. The orchestrator starts not
    /// ready; see [`set_ready`](Self::set_ready).
    pub fn new(
        cache: Arc<CircuitCache>,
        channel: ControlChannel,
        factory: Arc<dyn EngineFactory>,
        targets: TargetSettings,
        rotation: RotationConfig,
    ) -> Arc<Self> {
        let (requests, rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| {
            let worker = tokio::spawn(run_requests(weak.clone(), rx)).abort_handle();
            Self {
                cache,
                channel,
                factory,
                targets: Mutex::new(targets),
                rotation: Mutex::new(RotationConfig {
                    next_fire_ts: 0,
                    ..rotation
                }),
                rotation_timer: Mutex::new(None),
                ready: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                pending: Mutex::new(None),
                last_error: Mutex::new(None),
                last_reason: Mutex::new(None),
                requests,
                worker,
                requeue_delay: REQUEUE_DELAY,
            }
        })
    }

    /// The circuit cache rebuilds refresh.
    pub fn cache(&self) -> &Arc<CircuitCache> {
        &self.cache
    }

    /// Marks rebuild prerequisites as met or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Returns `true` once prerequisites are met.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Returns `true` while a rebuild runs.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Message of the last failed rebuild, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Records a failure outside a rebuild, such as a failed startup.
    pub fn record_error(&self, message: impl Into<String>) {
        *lock(&self.last_error) = Some(message.into());
    }

    /// Forgets the last failure.
    pub fn clear_error(&self) {
        *lock(&self.last_error) = None;
    }

    /// Reason of the last rebuild that ran, successful or not.
    pub fn last_reason(&self) -> Option<String> {
        lock(&self.last_reason).clone()
    }

    /// Current target settings.
    pub fn targets(&self) -> TargetSettings {
        lock(&self.targets).clone()
    }

    /// Sets the hop count used by the next rebuild. Returns the stored value.
    pub fn set_hop_count(&self, hop_count: u8) -> u8 {
        let hop_count = normalize_hop_count(hop_count);
        lock(&self.targets).hop_count = hop_count;
        hop_count
    }

    /// Sets the exit countries used by the next rebuild; empty means AUTO.
    pub fn set_exit_countries(&self, exit_countries: Vec<String>) {
        lock(&self.targets).exit_countries = exit_countries
            .into_iter()
            .map(|cc| cc.trim().to_ascii_lowercase())
            .filter(|cc| !cc.is_empty())
            .collect();
    }

    /// Requests a rebuild.
    ///
    /// Never blocks on another rebuild: while one runs, `reason` replaces
    /// whatever was pending and [`RebuildOutcome::Queued`] comes back at once.
    pub async fn request(&self, reason: &str) -> RebuildOutcome {
        if !self.is_ready() {
            plog(
                LogLevel::Warn,
                &format!("Rebuild reason={} refused: not ready", reason),
            );
            return RebuildOutcome::NotReady;
        }

        {
            let mut pending = lock(&self.pending);
            if self
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                if let Some(previous) = pending.replace(reason.to_string()) {
                    plog(
                        LogLevel::Debug,
                        &format!("Pending rebuild reason={} replaced", previous),
                    );
                }
                plog(
                    LogLevel::Info,
                    &format!("Rebuild in progress; queued reason={}", reason),
                );
                return RebuildOutcome::Queued;
            }
        }
        self.run_held(reason).await
    }

    /// Runs the pending reason once the previous rebuild has ended.
    ///
    /// Busy is held on entry. Requests that arrived in between replaced the
    /// slot, so only the latest reason runs.
    async fn run_pending(&self) {
        let reason = {
            let mut pending = lock(&self.pending);
            let reason = pending.take();
            match reason {
                Some(reason) if self.is_ready() => reason,
                dropped => {
                    if let Some(reason) = dropped {
                        plog(
                            LogLevel::Warn,
                            &format!("Queued rebuild reason={} dropped: not ready", reason),
                        );
                    }
                    self.busy.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };
        let outcome = self.run_held(&reason).await;
        plog(
            LogLevel::Debug,
            &format!("Queued rebuild reason={}: {}", reason, outcome),
        );
    }

    /// Executes one rebuild. The caller holds the busy flag.
    async fn run_held(&self, reason: &str) -> RebuildOutcome {
        let _guard = RebuildGuard(self);

        *lock(&self.last_reason) = Some(reason.to_string());
        let outcome = match self.execute(reason).await {
            Ok(()) => {
                *lock(&self.last_error) = None;
                plog(
                    LogLevel::Notice,
                    &format!("Rebuild reason={} completed", reason),
                );
                RebuildOutcome::Completed {
                    reason: reason.to_string(),
                }
            }
            Err(e) => {
                let message = e.to_string();
                plog(
                    LogLevel::Error,
                    &format!("Rebuild reason={} failed: {}", reason, message),
                );
                *lock(&self.last_error) = Some(message.clone());
                RebuildOutcome::Failed(message)
            }
        };
        self.ensure_rotation_timer();
        outcome
    }

    async fn execute(&self, reason: &str) -> Result<()> {
        plog(
            LogLevel::Info,
            &format!("Rebuild reason={} starting", reason),
        );
        self.stop_rotation_timer();

        if let Some(engine) = self.cache.set_engine(None) {
            if let Err(e) = engine.shutdown().await {
                plog(LogLevel::Warn, &format!("Engine shutdown failed: {}", e));
            }
        }

        if let Err(e) = self.new_identity().await {
            plog(LogLevel::Warn, &format!("SIGNAL NEWNYM failed: {}", e));
        }
        let closed = self.close_generic_circuits().await;
        plog(
            LogLevel::Debug,
            &format!("Closed {} generic circuits", closed),
        );

        if let Err(e) = self.cache.relays().refresh().await {
            plog(LogLevel::Warn, &format!("Relay refresh failed: {}", e));
        }
        self.install_engine().await?;

        self.cache.refresh().await;
        Ok(())
    }

    /// Builds an engine for the current targets, initializes it and hands
    /// it to the circuit cache.
    ///
    /// AUTO exit selection expands to the directory's available countries.
    pub async fn install_engine(&self) -> Result<()> {
        let available = self
            .cache
            .relays()
            .available_countries()
            .await
            .unwrap_or_else(|e| {
                plog(
                    LogLevel::Warn,
                    &format!("Available exit countries unknown: {}", e),
                );
                Vec::new()
            });

        let targets = self.targets().build(&available);
        if let Some(first) = targets.first() {
            plog(
                LogLevel::Info,
                &format!(
                    "Building engine: {} targets, {} hops, exits [{}]",
                    targets.len(),
                    first.hop_count,
                    first.exit_countries.join(",")
                ),
            );
        }
        let engine = self.factory.build(targets);
        engine.initialize().await?;
        self.cache.set_engine(Some(engine));
        Ok(())
    }

    /// Sends `SIGNAL NEWNYM`.
    pub async fn new_identity(&self) -> Result<()> {
        let reply = self.channel.submit("SIGNAL NEWNYM", NEWNYM_TIMEOUT).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "SIGNAL NEWNYM refused: {}",
                reply.status_line()
            )))
        }
    }

    /// Closes every generic-purpose circuit the control port reports.
    ///
    /// Returns how many were closed; individual failures are skipped.
    async fn close_generic_circuits(&self) -> usize {
        let records = match self.cache.fallback().circuit_status().await {
            Ok(records) => records,
            Err(e) => {
                plog(
                    LogLevel::Debug,
                    &format!("Cannot list circuits to close: {}", e),
                );
                return 0;
            }
        };

        let mut closed = 0;
        for record in records.iter().filter(|r| r.is_generic() && !r.id.is_empty()) {
            let command = format!("CLOSECIRCUIT {}", record.id);
            match self.channel.submit(&command, DEFAULT_COMMAND_TIMEOUT).await {
                Ok(reply) if reply.is_ok() => closed += 1,
                Ok(reply) => plog(
                    LogLevel::Debug,
                    &format!("{} refused: {}", command, reply.status_line()),
                ),
                Err(e) => plog(LogLevel::Debug, &format!("{} failed: {}", command, e)),
            }
        }
        closed
    }

    /// Issues `request(reason)` after `delay` on its own task.
    pub fn schedule(&self, reason: String, delay: Duration) {
        self.send_after(Scheduled::Request(reason), delay);
    }

    fn send_after(&self, work: Scheduled, delay: Duration) {
        let requests = self.requests.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Fails only once the orchestrator is gone.
            let _ = requests.send(work);
        });
    }

    /// Current rotation settings.
    pub fn rotation(&self) -> RotationConfig {
        *lock(&self.rotation)
    }

    /// Replaces the rotation settings, clamped, and arms or stops the timer.
    pub fn set_rotation(
        &self,
        enabled: bool,
        interval_secs: u64,
        variance_percent: u8,
    ) -> RotationConfig {
        *lock(&self.rotation) = RotationConfig::clamped(enabled, interval_secs, variance_percent);
        if enabled {
            self.ensure_rotation_timer();
        } else {
            self.stop_rotation_timer();
        }
        self.rotation()
    }

    /// Arms the rotation timer with a fresh jitter if rotation is enabled.
    pub fn ensure_rotation_timer(&self) {
        let delay = {
            let mut rotation = lock(&self.rotation);
            if !rotation.enabled {
                return;
            }
            let delay = rotation_delay(
                &mut rand::thread_rng(),
                rotation.interval_secs,
                rotation.variance_percent,
            );
            rotation.next_fire_ts = (now_epoch_secs() + delay.as_secs_f64()).floor() as u64;
            delay
        };

        let requests = self.requests.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = requests.send(Scheduled::Request(ROTATION_REASON.to_string()));
        });
        if let Some(previous) = lock(&self.rotation_timer).replace(timer) {
            previous.abort();
        }
        plog(
            LogLevel::Debug,
            &format!("Next rotation in {}s", delay.as_secs()),
        );
    }

    /// Cancels the rotation timer and zeroes the next-fire timestamp.
    pub fn stop_rotation_timer(&self) {
        if let Some(timer) = lock(&self.rotation_timer).take() {
            timer.abort();
        }
        lock(&self.rotation).next_fire_ts = 0;
    }

    /// Stops the timer and the request worker and refuses further rebuilds.
    pub fn shutdown(&self) {
        self.set_ready(false);
        self.stop_rotation_timer();
        self.worker.abort();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.rotation_timer).take() {
            timer.abort();
        }
        self.worker.abort();
    }
}
