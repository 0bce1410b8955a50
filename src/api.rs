//! High-level API for circuit-sidecar.
//!
//! This module provides [`CircuitManager`], the context object that owns
//! every long-lived piece of the sidecar and exposes the accessors a
//! transport layer needs.
//!
//! # Overview
//!
//! | Piece | Owned as | Role |
//! |-------|----------|------|
//! | [`ControlChannel`] | clone | Persistent pipelined control connection |
//! | [`CountryCache`] | `Arc` | Address → country with TTL and persistence |
//! | [`CircuitCache`] | `Arc` | Published circuit snapshot and relay index |
//! | [`Orchestrator`] | `Arc` | Serialized rebuilds and the rotation timer |
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────────────┐
//! │     new()       │ ◄── Wire collaborators, nothing connected yet
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    start()      │ ◄── Connect, relays, engine, first cycle,
//! └────────┬────────┘     ready, rotation, delayed sweep
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   accessors     │ ◄── circuits(), status(), set_rotation(), ...
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   shutdown()    │ ◄── Stop timers, stop engine, persist countries
//! └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use circuit_sidecar::{CircuitManager, Config, SortOrder};
//!
//! #[tokio::main]
//! async fn main() -> circuit_sidecar::Result<()> {
//!     let manager = CircuitManager::new(Config::default())?;
//!     manager.start().await?;
//!
//!     for circuit in manager.circuits(SortOrder::Desc) {
//!         println!("{} {:?}", circuit.id, circuit.hops);
//!     }
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::circuit::{now_epoch_secs, CircuitRecord, Hop};
use crate::config::{is_valid_country_code, Config, LogLevel};
use crate::control::{raw_exchange, ControlChannel, ControlEndpoint};
use crate::country::{country_key, CountryCache, RAW_LOOKUP_TIMEOUT};
use crate::engine::{ControlPortEngineFactory, EngineFactory};
use crate::error::{Error, Result};
use crate::geo::country_name;
use crate::logger::plog;
use crate::orchestrator::{Orchestrator, RebuildOutcome, RotationConfig, TargetSettings};
use crate::parser::parse_address_to_country;
use crate::pipeline::{CircuitCache, CircuitSnapshot, RawCircuitStatus, SortOrder, StatusFallback};
use crate::relays::{ConsensusRelays, RelayDirectory};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pause between failed startup attempts.
pub const START_RETRY_DELAY: Duration = Duration::from_millis(2500);

/// Point-in-time view of the sidecar for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SidecarStatus {
    /// Startup finished and rebuilds are accepted.
    pub ready: bool,
    /// A startup attempt is running.
    pub bootstrapping: bool,
    /// A rebuild is running.
    pub rebuilding: bool,
    /// When the last startup attempt began, epoch seconds.
    pub last_start_ts: Option<f64>,
    /// Last startup or rebuild failure.
    pub last_error: Option<String>,
    /// Hop count new engines are built with.
    pub hop_count: u8,
    /// Upper-case exit countries; empty means AUTO.
    pub exit_countries: Vec<String>,
    /// Rotation settings and next fire time.
    pub rotation: RotationConfig,
    /// When the circuit snapshot was last published, epoch seconds.
    pub cache_ts: Option<f64>,
    /// Circuits in the published snapshot.
    pub circuits_cached: usize,
    /// Relays in the relay index.
    pub relays_indexed: usize,
}

/// A country with usable exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitCountry {
    /// Upper-case ISO code.
    pub code: String,
    /// English name, empty if unknown.
    pub name: String,
}

/// Result of [`CircuitManager::set_exit_country`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitChange {
    /// Outcome of the rebuild the change triggered.
    pub outcome: RebuildOutcome,
    /// Set when the requested country was replaced by AUTO.
    pub warning: Option<String>,
    /// Upper-case exit countries now in effect; empty means AUTO.
    pub exit_countries: Vec<String>,
}

/// Result of [`CircuitManager::lookup_country`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryProbe {
    /// Address looked up.
    pub address: String,
    /// Reply text exactly as received.
    pub raw: String,
    /// Code parsed from `raw`, upper-case, empty on no match.
    pub country: String,
    /// What the country cache currently holds for the address.
    pub cached: Option<String>,
}

fn upper(codes: &[String]) -> Vec<String> {
    codes.iter().map(|cc| cc.to_ascii_uppercase()).collect()
}

/// Context object owning the sidecar's components.
pub struct CircuitManager {
    config: Config,
    channel: ControlChannel,
    countries: Arc<CountryCache>,
    cache: Arc<CircuitCache>,
    orchestrator: Arc<Orchestrator>,
    bootstrapping: AtomicBool,
    last_start_ts: Mutex<Option<f64>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for CircuitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitManager")
            .field("endpoint", self.channel.endpoint())
            .field("cache", &self.cache)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl CircuitManager {
    /// Wires the stock collaborators for `config`.
    ///
    /// Loads the country cache file if present. Nothing is connected until
    /// [`start`](Self::start). Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `control_ip` is not an IP address.
    pub fn new(config: Config) -> Result<Self> {
        let endpoint = ControlEndpoint::from_config(&config)?;
        let channel = ControlChannel::new(endpoint.clone());
        let countries = Arc::new(CountryCache::from_config(
            &config.cache,
            channel.clone(),
            endpoint.clone(),
        ));
        let relays = Arc::new(ConsensusRelays::new(channel.clone(), countries.clone()));
        let fallback = Arc::new(RawCircuitStatus::new(endpoint));
        let factory = Arc::new(ControlPortEngineFactory::new(channel.clone()));
        Ok(Self::from_parts(
            config, channel, countries, relays, fallback, factory,
        ))
    }

    /// Wires caller-supplied collaborators.
    pub fn from_parts(
        config: Config,
        channel: ControlChannel,
        countries: Arc<CountryCache>,
        relays: Arc<dyn RelayDirectory>,
        fallback: Arc<dyn StatusFallback>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let cache = Arc::new(CircuitCache::new(relays, countries.clone(), fallback));
        let orchestrator = Orchestrator::new(
            cache.clone(),
            channel.clone(),
            factory,
            TargetSettings::from_config(&config),
            RotationConfig::from(&config.rotation),
        );
        Self {
            config,
            channel,
            countries,
            cache,
            orchestrator,
            bootstrapping: AtomicBool::new(false),
            last_start_ts: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The country cache.
    pub fn countries(&self) -> &Arc<CountryCache> {
        &self.countries
    }

    /// The circuit cache.
    pub fn cache(&self) -> &Arc<CircuitCache> {
        &self.cache
    }

    /// The rebuild orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Returns `true` once [`start`](Self::start) has succeeded.
    pub fn is_ready(&self) -> bool {
        self.orchestrator.is_ready()
    }

    fn track(&self, task: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }

    /// Brings the sidecar up.
    ///
    /// Connects, loads relays, starts the circuit engine, starts the
    /// periodic cache cycle and runs one cycle, then marks the manager ready
    /// and arms rotation. The background country sweep starts after the
    /// configured delay.
    ///
    /// # Errors
    ///
    /// Any connection, relay or engine failure. The failure is also kept as
    /// the last error for [`status`](Self::status).
    pub async fn start(&self) -> Result<()> {
        self.orchestrator.set_ready(false);
        self.bootstrapping.store(true, Ordering::SeqCst);
        *self.last_start_ts.lock().unwrap_or_else(|e| e.into_inner()) = Some(now_epoch_secs());
        self.abort_tasks();

        let result = self.bootstrap().await;
        self.bootstrapping.store(false, Ordering::SeqCst);
        if let Err(ref e) = result {
            self.orchestrator.record_error(e.to_string());
        }
        result
    }

    async fn bootstrap(&self) -> Result<()> {
        self.channel.ensure_connected().await?;
        plog(
            LogLevel::Notice,
            &format!("Connected to control port {}", self.channel.endpoint().address),
        );

        self.cache.relays().refresh().await?;
        let relays = self.cache.refresh_relay_index().await?;
        plog(LogLevel::Info, &format!("Relay index holds {} relays", relays));

        self.orchestrator.install_engine().await?;

        let period = Duration::from_secs(self.config.cache.refresh_interval_secs);
        self.track(self.cache.spawn_periodic(period).abort_handle());
        let report = self.cache.refresh().await;
        plog(
            LogLevel::Info,
            &format!("Initial circuit cache: {} circuits", report.published),
        );

        self.orchestrator.clear_error();
        self.orchestrator.set_ready(true);
        self.orchestrator.ensure_rotation_timer();
        self.schedule_sweep(Duration::from_secs(self.config.cache.sweep_delay_secs));
        plog(LogLevel::Notice, "Circuit sidecar ready");
        Ok(())
    }

    fn schedule_sweep(&self, delay: Duration) {
        let cache = self.cache.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let addresses = cache.relay_index().addresses();
            let report = cache.countries().sweep(&addresses).await;
            plog(
                LogLevel::Debug,
                &format!(
                    "Country sweep: {} attempted, {} resolved",
                    report.attempted, report.resolved
                ),
            );
        });
        self.track(task.abort_handle());
    }

    /// Stops background work, stops the engine and persists the country
    /// cache. Failures are logged.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.abort_tasks();

        if let Some(engine) = self.cache.set_engine(None) {
            if let Err(e) = engine.shutdown().await {
                plog(LogLevel::Warn, &format!("Engine shutdown failed: {}", e));
            }
        }
        match self.countries.persist_configured().await {
            Ok(()) => plog(
                LogLevel::Info,
                &format!("Country cache saved ({} entries)", self.countries.len()),
            ),
            Err(e) => plog(
                LogLevel::Warn,
                &format!("Cannot save country cache: {}", e),
            ),
        }
        self.channel.close();
        plog(LogLevel::Notice, "Circuit sidecar stopped");
    }

    /// Published circuits; [`SortOrder::Desc`] lists the newest first.
    pub fn circuits(&self, order: SortOrder) -> Vec<CircuitRecord> {
        self.cache.circuits(order)
    }

    /// The published snapshot with its timestamp.
    pub fn snapshot(&self) -> Arc<CircuitSnapshot> {
        self.cache.snapshot()
    }

    /// Hops of the newest circuit, empty if none.
    pub fn newest_hops(&self) -> Vec<Hop> {
        self.cache.newest_hops()
    }

    /// Rotation settings.
    pub fn rotation(&self) -> RotationConfig {
        self.orchestrator.rotation()
    }

    /// Changes rotation settings; values are clamped.
    pub fn set_rotation(
        &self,
        enabled: bool,
        interval_secs: u64,
        variance_percent: u8,
    ) -> RotationConfig {
        let rotation = self
            .orchestrator
            .set_rotation(enabled, interval_secs, variance_percent);
        plog(
            LogLevel::Info,
            &format!(
                "Rotation {} every {}s ±{}%",
                if rotation.enabled { "enabled" } else { "disabled" },
                rotation.interval_secs,
                rotation.variance_percent
            ),
        );
        rotation
    }

    /// Requests a rebuild.
    pub async fn trigger_rebuild(&self, reason: &str) -> RebuildOutcome {
        self.orchestrator.request(reason).await
    }

    /// Signals the daemon to switch to clean circuits.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`] before startup, otherwise any command failure.
    pub async fn new_identity(&self) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotReady("sidecar has not started".to_string()));
        }
        self.orchestrator.new_identity().await
    }

    /// Sets the hop count (2 or 3, anything else becomes 3) and rebuilds.
    pub async fn set_hop_count(&self, hop_count: u8) -> (u8, RebuildOutcome) {
        let hop_count = self.orchestrator.set_hop_count(hop_count);
        (hop_count, self.orchestrator.request("hopmode").await)
    }

    /// Restricts exits to one country, or AUTO, and rebuilds.
    ///
    /// A country that currently has no usable exits falls back to AUTO with
    /// a warning.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `country` is neither `AUTO` nor a two-letter code.
    pub async fn set_exit_country(&self, country: &str) -> Result<ExitChange> {
        let code = country.trim().to_ascii_uppercase();
        let desired = if code.is_empty() || code == "AUTO" {
            None
        } else if is_valid_country_code(&code) {
            Some(code.to_ascii_lowercase())
        } else {
            return Err(Error::Config(format!("invalid exit country: {}", country)));
        };

        let mut warning = None;
        let reason = match desired {
            Some(cc) => {
                let available = self
                    .cache
                    .relays()
                    .available_countries()
                    .await
                    .unwrap_or_default();
                if !available.is_empty() && !available.contains(&cc) {
                    let message =
                        format!("Exit {} not available right now; falling back to AUTO", code);
                    plog(LogLevel::Warn, &message);
                    warning = Some(message);
                    self.orchestrator.set_exit_countries(Vec::new());
                    "exit_invalid_fallback"
                } else {
                    self.orchestrator.set_exit_countries(vec![cc]);
                    "exit"
                }
            }
            None => {
                self.orchestrator.set_exit_countries(Vec::new());
                "exit"
            }
        };

        let outcome = self.orchestrator.request(reason).await;
        Ok(ExitChange {
            outcome,
            warning,
            exit_countries: upper(&self.orchestrator.targets().exit_countries),
        })
    }

    /// Countries that currently have usable exits, by code.
    pub async fn available_exits(&self) -> Result<Vec<ExitCountry>> {
        Ok(self
            .cache
            .relays()
            .available_countries()
            .await?
            .into_iter()
            .map(|cc| ExitCountry {
                name: country_name(&cc).to_string(),
                code: cc.to_ascii_uppercase(),
            })
            .collect())
    }

    /// Runs one uncached country lookup over a fresh connection.
    pub async fn lookup_country(&self, address: &str) -> Result<CountryProbe> {
        let reply = raw_exchange(
            self.channel.endpoint(),
            &format!("GETINFO {}", country_key(address)),
            RAW_LOOKUP_TIMEOUT,
        )
        .await?;
        Ok(CountryProbe {
            address: address.to_string(),
            country: parse_address_to_country(&reply.text, address),
            raw: reply.text,
            cached: self.countries.cached(address),
        })
    }

    /// Status summary.
    pub fn status(&self) -> SidecarStatus {
        let targets = self.orchestrator.targets();
        let snapshot = self.cache.snapshot();
        SidecarStatus {
            ready: self.is_ready(),
            bootstrapping: self.bootstrapping.load(Ordering::SeqCst),
            rebuilding: self.orchestrator.is_busy(),
            last_start_ts: *self.last_start_ts.lock().unwrap_or_else(|e| e.into_inner()),
            last_error: self.orchestrator.last_error(),
            hop_count: targets.hop_count,
            exit_countries: upper(&targets.exit_countries),
            rotation: self.orchestrator.rotation(),
            cache_ts: snapshot.refreshed_at,
            circuits_cached: snapshot.circuits.len(),
            relays_indexed: self.cache.relay_index().len(),
        }
    }
}

/// Runs the sidecar until CTRL+C.
///
/// Startup is retried every [`START_RETRY_DELAY`] until it succeeds, the
/// configured `retry_limit` is used up, or CTRL+C arrives.
///
/// # Errors
///
/// Returns the last startup error once the retry limit is reached, or a
/// configuration error from wiring the manager.
pub async fn run_main(config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        let wake = wake.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
                shutdown.store(true, Ordering::SeqCst);
                wake.notify_one();
            }
        });
    }

    let manager = CircuitManager::new(config.clone())?;
    let mut attempts = 0u32;
    let mut started = false;

    while !shutdown.load(Ordering::SeqCst) {
        attempts += 1;
        match manager.start().await {
            Ok(()) => {
                started = true;
                break;
            }
            Err(e) => {
                plog(
                    LogLevel::Warn,
                    &format!("Startup attempt {} failed: {}", attempts, e),
                );
                if config.retry_limit.is_some_and(|limit| attempts >= limit) {
                    manager.shutdown().await;
                    return Err(e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(START_RETRY_DELAY) => {}
                    _ = wake.notified() => {}
                }
            }
        }
    }

    if started && !shutdown.load(Ordering::SeqCst) {
        wake.notified().await;
    }
    manager.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::RawCircuit;
    use crate::engine::{CircuitEngine, CircuitTarget};
    use crate::parser::parse_circuit_status_lines;
    use crate::relays::Relay;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct StubDirectory;

    #[async_trait]
    impl RelayDirectory for StubDirectory {
        async fn relays(&self) -> Result<Vec<Relay>> {
            Ok(vec![Relay {
                fingerprint: "AAAA".into(),
                nickname: "alpha".into(),
                address: "192.0.2.1".into(),
                flags: vec!["Exit".into()],
                country: Some("NL".into()),
                ..Relay::default()
            }])
        }
        async fn available_countries(&self) -> Result<Vec<String>> {
            Ok(vec!["nl".into(), "se".into()])
        }
        async fn refresh(&self) -> Result<()> {
            Ok(())
        }
    }

    struct StubFallback;

    #[async_trait]
    impl StatusFallback for StubFallback {
        async fn circuit_status(&self) -> Result<Vec<CircuitRecord>> {
            Ok(parse_circuit_status_lines(["4 BUILT $AAAA~alpha PURPOSE=GENERAL"]))
        }
    }

    struct IdleEngine;

    #[async_trait]
    impl CircuitEngine for IdleEngine {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        async fn list_circuits(&self) -> Result<Vec<RawCircuit>> {
            Ok(Vec::new())
        }
    }

    struct IdleFactory;

    impl EngineFactory for IdleFactory {
        fn build(&self, _targets: Vec<CircuitTarget>) -> Arc<dyn CircuitEngine> {
            Arc::new(IdleEngine)
        }
    }

    /// Control port that answers country lookups with `de` and everything
    /// else with `250 OK`.
    async fn fake_port() -> (ControlEndpoint, tempfile::NamedTempFile) {
        let cookie = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(cookie.path(), [5u8; 32]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ControlEndpoint::new(listener.local_addr().unwrap(), cookie.path());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = match line.strip_prefix("GETINFO ip-to-country/") {
                            Some(address) => {
                                format!("250-ip-to-country/{}=de\r\n250 OK\r\n", address)
                            }
                            None => "250 OK\r\n".to_string(),
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (endpoint, cookie)
    }

    async fn manager(
        countries: CountryCache,
    ) -> (CircuitManager, tempfile::NamedTempFile) {
        let (endpoint, cookie) = fake_port().await;
        let mut config = Config::default();
        config.rotation.enabled = false;
        config.cache.sweep_delay_secs = 3600;
        let manager = CircuitManager::from_parts(
            config,
            ControlChannel::new(endpoint),
            Arc::new(countries),
            Arc::new(StubDirectory) as Arc<dyn RelayDirectory>,
            Arc::new(StubFallback) as Arc<dyn StatusFallback>,
            Arc::new(IdleFactory) as Arc<dyn EngineFactory>,
        );
        (manager, cookie)
    }

    fn empty_countries() -> CountryCache {
        CountryCache::new(Duration::from_secs(600), Vec::new())
    }

    #[tokio::test]
    async fn test_start_publishes_and_reports_ready() {
        let (manager, _cookie) = manager(empty_countries()).await;
        assert!(!manager.status().ready);
        assert!(matches!(
            manager.new_identity().await,
            Err(Error::NotReady(_))
        ));

        manager.start().await.unwrap();
        let status = manager.status();
        assert!(status.ready);
        assert!(!status.bootstrapping);
        assert_eq!(status.last_error, None);
        assert_eq!(status.circuits_cached, 1);
        assert_eq!(status.relays_indexed, 1);
        assert!(status.cache_ts.is_some());
        assert!(status.last_start_ts.is_some());

        let hops = manager.newest_hops();
        assert_eq!(hops[0].country_code, "NL");
        assert_eq!(hops[0].country_name, "Netherlands");
        assert_eq!(manager.circuits(SortOrder::Desc)[0].id, "4");

        manager.new_identity().await.unwrap();
        manager.shutdown().await;
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn test_unavailable_exit_falls_back_to_auto() {
        let (manager, _cookie) = manager(empty_countries()).await;
        manager.start().await.unwrap();

        let change = manager.set_exit_country("se").await.unwrap();
        assert!(change.outcome.is_completed());
        assert_eq!(change.exit_countries, vec!["SE"]);
        assert!(change.warning.is_none());

        let change = manager.set_exit_country("JP").await.unwrap();
        assert!(change.warning.is_some());
        assert!(change.exit_countries.is_empty());
        assert_eq!(
            manager.orchestrator().last_reason().as_deref(),
            Some("exit_invalid_fallback")
        );

        assert!(matches!(
            manager.set_exit_country("narnia").await,
            Err(Error::Config(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_hop_count_and_rotation_accessors() {
        let (manager, _cookie) = manager(empty_countries()).await;
        let (hops, outcome) = manager.set_hop_count(2).await;
        assert_eq!(hops, 2);
        assert_eq!(outcome, RebuildOutcome::NotReady);

        manager.start().await.unwrap();
        let (hops, outcome) = manager.set_hop_count(4).await;
        assert_eq!(hops, 3);
        assert!(outcome.is_completed());
        assert_eq!(manager.status().hop_count, 3);

        let rotation = manager.set_rotation(true, 30, 10);
        assert_eq!(rotation.interval_secs, 60);
        assert!(rotation.next_fire_ts > 0);
        assert_eq!(manager.set_rotation(false, 600, 20).next_fire_ts, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_available_exits_carry_names() {
        let (manager, _cookie) = manager(empty_countries()).await;
        let exits = manager.available_exits().await.unwrap();
        assert_eq!(
            exits,
            vec![
                ExitCountry {
                    code: "NL".into(),
                    name: "Netherlands".into()
                },
                ExitCountry {
                    code: "SE".into(),
                    name: "Sweden".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_lookup_country_returns_raw_and_parsed() {
        let (manager, _cookie) = manager(empty_countries()).await;
        let probe = manager.lookup_country("203.0.113.5").await.unwrap();
        assert_eq!(probe.country, "DE");
        assert!(probe.raw.contains("ip-to-country/203.0.113.5=de"));
        assert_eq!(probe.cached, None);
    }

    #[tokio::test]
    async fn test_shutdown_persists_country_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("countries.json");
        let countries = empty_countries().with_file(file.clone());
        countries.insert("198.51.100.7", "FR");

        let (manager, _cookie) = manager(countries).await;
        manager.shutdown().await;

        let content = std::fs::read_to_string(&file).unwrap();
        assert!(content.contains("198.51.100.7"));
        assert!(content.contains("\"fr\""));
    }

    #[tokio::test]
    async fn test_run_main_gives_up_after_retry_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.control_ip = address.ip().to_string();
        config.control_port = address.port();
        config.cookie_path = dir.path().join("missing_cookie");
        config.cache.file = dir.path().join("countries.json");
        config.retry_limit = Some(1);

        assert!(run_main(config).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let endpoint = ControlEndpoint::new(address, "/nonexistent/cookie");
        let manager = CircuitManager::from_parts(
            Config::default(),
            ControlChannel::new(endpoint),
            Arc::new(empty_countries()),
            Arc::new(StubDirectory) as Arc<dyn RelayDirectory>,
            Arc::new(StubFallback) as Arc<dyn StatusFallback>,
            Arc::new(IdleFactory) as Arc<dyn EngineFactory>,
        );

        assert!(manager.start().await.is_err());
        let status = manager.status();
        assert!(!status.ready);
        assert!(status.last_error.is_some());
    }
}
