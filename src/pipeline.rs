//! Periodic circuit cache pipeline.
//!
//! Every cycle rebuilds the published circuit view from scratch and swaps it
//! in atomically. Readers always see either the previous snapshot or the new
//! one, never a half-built list.
//!
//! # Cycle
//!
//! ```text
//!   ┌────────────────────┐
//!   │ 1. relay index     │──▶ seed country cache from relay metadata
//!   └─────────┬──────────┘
//!             ▼
//!   ┌────────────────────┐  empty / error  ┌────────────────────────┐
//!   │ 2. engine circuits │────────────────▶│ raw circuit-status     │
//!   └─────────┬──────────┘                 │ over one-off socket    │
//!             ▼                            └───────────┬────────────┘
//!   ┌────────────────────┐◀────────────────────────────┘
//!   │ 3. normalize,      │
//!   │    generic only    │
//!   └─────────┬──────────┘
//!             ▼
//!   ┌────────────────────┐
//!   │ 4. established     │
//!   └─────────┬──────────┘
//!             ▼
//!   ┌────────────────────┐
//!   │ 5. sort by first   │
//!   │    seen, ascending │
//!   └─────────┬──────────┘
//!             ▼
//!   ┌────────────────────┐
//!   │ 6. enrich hops     │──▶ nickname/address from index, country via cache
//!   └─────────┬──────────┘
//!             ▼
//!   ┌────────────────────┐
//!   │ 7. publish         │
//!   └────────────────────┘
//! ```
//!
//! Each step is best-effort. A failure is logged, recorded in the
//! [`CycleReport`], and the cycle continues with whatever it has.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::circuit::{normalize, now_epoch_secs, CircuitRecord, FirstSeen, Hop, RawCircuit};
use crate::config::LogLevel;
use crate::control::{raw_exchange, ControlEndpoint};
use crate::country::CountryCache;
use crate::engine::CircuitEngine;
use crate::error::{Error, Result};
use crate::geo::country_name;
use crate::logger::plog;
use crate::parser::{extract_data_block, parse_circuit_status_lines};
use crate::relays::{RelayDirectory, RelayIndex};

/// Deadline for the raw circuit-status fallback.
pub const RAW_STATUS_TIMEOUT: Duration = Duration::from_secs(12);

/// Order of a circuit listing by first-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" | "" => Ok(SortOrder::Desc),
            other => Err(Error::Config(format!("invalid sort order: {}", other))),
        }
    }
}

/// Published circuit view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitSnapshot {
    /// Established generic circuits, oldest first.
    pub circuits: Vec<CircuitRecord>,
    /// When the snapshot was published, epoch seconds.
    pub refreshed_at: Option<f64>,
}

/// Where a cycle's circuits came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitSourceKind {
    /// The circuit engine.
    Engine,
    /// The raw circuit-status fallback.
    Fallback,
    /// Neither produced anything.
    #[default]
    None,
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another cycle was running; nothing was done.
    pub skipped: bool,
    /// Relays in the index after step 1.
    pub relays_indexed: usize,
    /// Where circuits came from.
    pub source: CircuitSourceKind,
    /// Raw circuits fetched.
    pub fetched: usize,
    /// Circuits published.
    pub published: usize,
    /// Hops left without a country.
    pub unresolved_hops: usize,
    /// Failures folded into the result, one line each.
    pub failures: Vec<String>,
}

/// Circuit-status source used when the engine has nothing.
#[async_trait]
pub trait StatusFallback: Send + Sync {
    /// Parsed circuit-status records.
    async fn circuit_status(&self) -> Result<Vec<CircuitRecord>>;
}

/// Fallback over a fresh one-off control connection.
pub struct RawCircuitStatus {
    endpoint: ControlEndpoint,
}

impl RawCircuitStatus {
    /// Creates a fallback against `endpoint`.
    pub fn new(endpoint: ControlEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl StatusFallback for RawCircuitStatus {
    async fn circuit_status(&self) -> Result<Vec<CircuitRecord>> {
        let reply = raw_exchange(&self.endpoint, "GETINFO circuit-status", RAW_STATUS_TIMEOUT).await?;
        if !reply.is_ok() {
            return Err(Error::Protocol(format!(
                "circuit-status refused: {}",
                reply.status_line()
            )));
        }
        Ok(parse_circuit_status_lines(extract_data_block(
            &reply.text,
            "circuit-status",
        )))
    }
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owner of the published circuit snapshot and the relay index.
pub struct CircuitCache {
    relays: Arc<dyn RelayDirectory>,
    countries: Arc<CountryCache>,
    fallback: Arc<dyn StatusFallback>,
    engine: RwLock<Option<Arc<dyn CircuitEngine>>>,
    relay_index: RwLock<Arc<RelayIndex>>,
    snapshot: RwLock<Arc<CircuitSnapshot>>,
    first_seen: Mutex<FirstSeen>,
    refreshing: AtomicBool,
}

impl std::fmt::Debug for CircuitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CircuitCache")
            .field("circuits", &snapshot.circuits.len())
            .field("refreshed_at", &snapshot.refreshed_at)
            .field("relays", &self.relay_index().len())
            .finish()
    }
}

impl CircuitCache {
    /// Creates a cache with an empty snapshot and no engine.
    pub fn new(
        relays: Arc<dyn RelayDirectory>,
        countries: Arc<CountryCache>,
        fallback: Arc<dyn StatusFallback>,
    ) -> Self {
        Self {
            relays,
            countries,
            fallback,
            engine: RwLock::new(None),
            relay_index: RwLock::new(Arc::new(RelayIndex::default())),
            snapshot: RwLock::new(Arc::new(CircuitSnapshot::default())),
            first_seen: Mutex::new(FirstSeen::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// The country cache used for enrichment.
    pub fn countries(&self) -> &Arc<CountryCache> {
        &self.countries
    }

    /// The relay directory.
    pub fn relays(&self) -> &Arc<dyn RelayDirectory> {
        &self.relays
    }

    /// The circuit-status source used when the engine has nothing.
    pub fn fallback(&self) -> &Arc<dyn StatusFallback> {
        &self.fallback
    }

    /// The current engine, if any.
    pub fn engine(&self) -> Option<Arc<dyn CircuitEngine>> {
        self.engine
            .read()
            .map(|e| e.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Installs a new engine, returning the previous one.
    pub fn set_engine(
        &self,
        engine: Option<Arc<dyn CircuitEngine>>,
    ) -> Option<Arc<dyn CircuitEngine>> {
        let mut slot = self.engine.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, engine)
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<CircuitSnapshot> {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// The current relay index.
    pub fn relay_index(&self) -> Arc<RelayIndex> {
        self.relay_index
            .read()
            .map(|i| i.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Published circuits in the requested order.
    pub fn circuits(&self, order: SortOrder) -> Vec<CircuitRecord> {
        let mut circuits = self.snapshot().circuits.clone();
        if order == SortOrder::Desc {
            circuits.reverse();
        }
        circuits
    }

    /// Hops of the most recently seen circuit.
    pub fn newest_hops(&self) -> Vec<Hop> {
        self.snapshot()
            .circuits
            .last()
            .map(|c| c.hops.clone())
            .unwrap_or_default()
    }

    fn publish(&self, circuits: Vec<CircuitRecord>) {
        let snapshot = Arc::new(CircuitSnapshot {
            circuits,
            refreshed_at: Some(now_epoch_secs()),
        });
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Refreshes the relay index from the directory.
    ///
    /// Relays that already carry a country seed the country cache.
    pub async fn refresh_relay_index(&self) -> Result<usize> {
        let relays = self.relays.relays().await?;
        let index = RelayIndex::from_relays(relays);
        let seeded = self.countries.seed(index.known_countries());
        let count = index.len();
        *self.relay_index.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(index);
        plog(
            LogLevel::Debug,
            &format!("Relay index: {} relays, {} countries seeded", count, seeded),
        );
        Ok(count)
    }

    async fn fetch(&self, report: &mut CycleReport) -> Vec<RawCircuit> {
        if let Some(engine) = self.engine() {
            match engine.list_circuits().await {
                Ok(circuits) if !circuits.is_empty() => {
                    report.source = CircuitSourceKind::Engine;
                    return circuits;
                }
                Ok(_) => {}
                Err(e) => {
                    plog(LogLevel::Warn, &format!("Engine circuit list failed: {}", e));
                    report.failures.push(format!("engine: {}", e));
                }
            }
        }

        match self.fallback.circuit_status().await {
            Ok(records) => {
                if !records.is_empty() {
                    report.source = CircuitSourceKind::Fallback;
                }
                records.into_iter().map(RawCircuit::Parsed).collect()
            }
            Err(e) => {
                plog(
                    LogLevel::Warn,
                    &format!("Raw circuit-status fallback failed: {}", e),
                );
                report.failures.push(format!("fallback: {}", e));
                Vec::new()
            }
        }
    }

    /// Runs one cycle and publishes its result.
    ///
    /// An overlapping call returns immediately with `skipped` set.
    pub async fn refresh(&self) -> CycleReport {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        }
        let _guard = FlagGuard(&self.refreshing);
        let mut report = CycleReport::default();

        match self.refresh_relay_index().await {
            Ok(count) => report.relays_indexed = count,
            Err(e) => {
                plog(LogLevel::Warn, &format!("Relay index refresh failed: {}", e));
                report.failures.push(format!("relays: {}", e));
                report.relays_indexed = self.relay_index().len();
            }
        }

        let raw = self.fetch(&mut report).await;
        report.fetched = raw.len();

        let now = now_epoch_secs();
        let mut records: Vec<CircuitRecord> = raw.into_iter().map(normalize).collect();
        {
            let mut first_seen = self.first_seen.lock().unwrap_or_else(|e| e.into_inner());
            let live: HashSet<String> = records
                .iter()
                .filter(|r| !r.id.is_empty())
                .map(|r| r.id.clone())
                .collect();
            for record in records.iter_mut() {
                first_seen.stamp(record, now);
            }
            first_seen.retain_live(&live);
        }

        records.retain(|r| r.is_generic() && r.state.is_established());
        records.sort_by(|a, b| a.sort_key().total_cmp(&b.sort_key()));

        report.unresolved_hops = self.enrich(&mut records).await;
        report.published = records.len();
        self.publish(records);

        plog(
            LogLevel::Info,
            &format!(
                "Circuit cache refreshed: {} published of {} fetched ({:?})",
                report.published, report.fetched, report.source
            ),
        );
        report
    }

    /// Fills hop details in place. Returns hops left without a country.
    async fn enrich(&self, records: &mut [CircuitRecord]) -> usize {
        let index = self.relay_index();

        for hop in records.iter_mut().flat_map(|r| r.hops.iter_mut()) {
            if let Some(relay) = index.get(&hop.fingerprint) {
                if hop.nickname.is_empty() {
                    hop.nickname = relay.nickname.clone();
                }
                if hop.address.is_empty() {
                    hop.address = relay.address.clone();
                }
                if hop.country_code.is_empty() {
                    if let Some(cc) = &relay.country {
                        hop.country_code = cc.to_ascii_uppercase();
                    }
                }
            }
        }

        let missing: Vec<String> = records
            .iter()
            .flat_map(|r| r.hops.iter())
            .filter(|h| h.country_code.is_empty() && !h.address.is_empty())
            .map(|h| h.address.clone())
            .collect();
        if !missing.is_empty() {
            self.countries.batch_resolve(&missing).await;
            self.countries.resolve_remaining(&missing).await;
        }

        let mut unresolved = 0;
        for hop in records.iter_mut().flat_map(|r| r.hops.iter_mut()) {
            if hop.country_code.is_empty() && !hop.address.is_empty() {
                if let Some(cc) = self.countries.cached(&hop.address) {
                    hop.country_code = cc;
                }
            }
            if hop.country_code.is_empty() {
                unresolved += 1;
            } else if hop.country_name.is_empty() {
                hop.country_name = country_name(&hop.country_code).to_string();
            }
        }
        unresolved
    }

    /// Runs [`refresh`](Self::refresh) every `period`, starting one period
    /// from now.
    pub fn spawn_periodic(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let report = cache.refresh().await;
                if !report.failures.is_empty() {
                    plog(
                        LogLevel::Debug,
                        &format!("Cycle failures: {}", report.failures.join("; ")),
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{
        CircuitState, EngineCircuit, HopRole, RawPath, RawRelay, RawTimestamp,
    };
    use crate::country::CountryLookup;
    use crate::relays::Relay;
    use std::sync::atomic::AtomicUsize;

    struct StubDirectory {
        relays: Vec<Relay>,
    }

    #[async_trait]
    impl RelayDirectory for StubDirectory {
        async fn relays(&self) -> Result<Vec<Relay>> {
            Ok(self.relays.clone())
        }
        async fn available_countries(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn refresh(&self) -> Result<()> {
            Ok(())
        }
    }

    struct StubEngine {
        circuits: Vec<RawCircuit>,
    }

    #[async_trait]
    impl CircuitEngine for StubEngine {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        async fn list_circuits(&self) -> Result<Vec<RawCircuit>> {
            if self.circuits.is_empty() {
                Err(Error::Engine("not running".into()))
            } else {
                Ok(self.circuits.clone())
            }
        }
    }

    struct StubFallback {
        lines: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusFallback for StubFallback {
        async fn circuit_status(&self) -> Result<Vec<CircuitRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(parse_circuit_status_lines(self.lines.iter()))
        }
    }

    struct FixedLookup;

    #[async_trait]
    impl CountryLookup for FixedLookup {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn lookup(&self, address: &str) -> Result<String> {
            Ok(if address.starts_with("192.0.2.") {
                "DE".to_string()
            } else {
                String::new()
            })
        }
    }

    fn relay(fp: &str, nick: &str, addr: &str) -> Relay {
        Relay {
            fingerprint: fp.into(),
            nickname: nick.into(),
            address: addr.into(),
            ..Relay::default()
        }
    }

    fn build_cache(
        relays: Vec<Relay>,
        fallback_lines: Vec<&'static str>,
    ) -> (Arc<CircuitCache>, Arc<StubFallback>) {
        let countries = Arc::new(CountryCache::new(
            Duration::from_secs(600),
            vec![Arc::new(FixedLookup) as Arc<dyn CountryLookup>],
        ));
        let fallback = Arc::new(StubFallback {
            lines: fallback_lines,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(CircuitCache::new(
            Arc::new(StubDirectory { relays }),
            countries,
            fallback.clone() as Arc<dyn StatusFallback>,
        ));
        (cache, fallback)
    }

    #[tokio::test]
    async fn test_only_generic_circuit_is_published_and_enriched() {
        let (cache, fallback) = build_cache(
            vec![
                relay("AAAA", "alpha", "192.0.2.1"),
                relay("BBBB", "bravo", "198.51.100.2"),
            ],
            Vec::new(),
        );
        let engine = StubEngine {
            circuits: vec![
                RawCircuit::Engine(EngineCircuit {
                    id: Some("1".into()),
                    status: "BUILT".into(),
                    purpose: Some("general".into()),
                    created: None,
                    path: RawPath::Route("$AAAA,$BBBB".into()),
                }),
                RawCircuit::Engine(EngineCircuit {
                    id: Some("2".into()),
                    status: "BUILT".into(),
                    purpose: Some("HS_VANGUARDS".into()),
                    created: None,
                    path: RawPath::Route("$AAAA,$BBBB".into()),
                }),
            ],
        };
        cache.set_engine(Some(Arc::new(engine) as Arc<dyn CircuitEngine>));

        let report = cache.refresh().await;
        assert_eq!(report.source, CircuitSourceKind::Engine);
        assert_eq!((report.fetched, report.published), (2, 1));
        assert_eq!(report.unresolved_hops, 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

        let circuits = cache.circuits(SortOrder::Asc);
        assert_eq!(circuits.len(), 1);
        let hops = &circuits[0].hops;
        assert_eq!(hops[0].role, HopRole::Entry);
        assert_eq!(hops[0].nickname, "alpha");
        assert_eq!(hops[0].address, "192.0.2.1");
        assert_eq!(hops[0].country_code, "DE");
        assert_eq!(hops[0].country_name, "Germany");
        assert_eq!(hops[1].role, HopRole::Exit);
        assert_eq!(hops[1].nickname, "bravo");
        assert_eq!(hops[1].country_code, "");
        assert!(circuits[0].created_at.is_some());
        assert!(cache.snapshot().refreshed_at.is_some());
    }

    /// Fails every lookup after a fixed delay.
    struct SlowFailingLookup {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CountryLookup for SlowFailingLookup {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn lookup(&self, address: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err(Error::Timeout(format!("lookup of {}", address)))
        }
    }

    #[tokio::test]
    async fn test_unresolvable_repeated_hops_stay_bounded() {
        let chain: Vec<Arc<SlowFailingLookup>> = ["channel", "stem", "raw"]
            .into_iter()
            .map(|name| {
                Arc::new(SlowFailingLookup {
                    name,
                    calls: AtomicUsize::new(0),
                })
            })
            .collect();
        let countries = Arc::new(CountryCache::new(
            Duration::from_secs(600),
            chain
                .iter()
                .map(|l| l.clone() as Arc<dyn CountryLookup>)
                .collect(),
        ));
        let relays = (1..=4)
            .map(|i| relay(&format!("F{}", i), &format!("n{}", i), &format!("203.0.113.{}", i)))
            .collect();
        let lines = vec![
            "1 BUILT $F1~n1,$F2~n2,$F3~n3 PURPOSE=GENERAL",
            "2 BUILT $F2~n2,$F3~n3,$F4~n4 PURPOSE=GENERAL",
            "3 BUILT $F1~n1,$F3~n3,$F4~n4 PURPOSE=GENERAL",
            "4 BUILT $F4~n4,$F2~n2,$F1~n1 PURPOSE=GENERAL",
            "5 BUILT $F3~n3,$F1~n1,$F2~n2 PURPOSE=GENERAL",
        ];
        let fallback = Arc::new(StubFallback {
            lines,
            calls: AtomicUsize::new(0),
        });
        let cache = CircuitCache::new(
            Arc::new(StubDirectory { relays }),
            countries,
            fallback as Arc<dyn StatusFallback>,
        );

        let started = std::time::Instant::now();
        let report = cache.refresh().await;
        let elapsed = started.elapsed();

        assert_eq!(report.published, 5);
        assert_eq!(report.unresolved_hops, 15);
        let calls: Vec<usize> = chain.iter().map(|l| l.calls.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![4, 4, 4]);
        assert!(elapsed < Duration::from_secs(2), "cycle took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_falls_back_when_engine_fails() {
        let (cache, fallback) = build_cache(
            Vec::new(),
            vec![
                "5 BUILT $CC~charlie PURPOSE=GENERAL",
                "6 EXTENDED $DD~delta PURPOSE=GENERAL",
                "7 CLOSED $EE~echo",
            ],
        );
        cache.set_engine(Some(
            Arc::new(StubEngine { circuits: Vec::new() }) as Arc<dyn CircuitEngine>
        ));

        let report = cache.refresh().await;
        assert_eq!(report.source, CircuitSourceKind::Fallback);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.published, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.newest_hops()[0].nickname, "charlie");
    }

    #[tokio::test]
    async fn test_sorted_by_first_seen_and_ordered_views() {
        let (cache, _) = build_cache(Vec::new(), Vec::new());
        let circuit = |id: &str, ts: f64| {
            RawCircuit::Engine(EngineCircuit {
                id: Some(id.into()),
                status: "READY".into(),
                purpose: None,
                created: Some(RawTimestamp::Epoch(ts)),
                path: RawPath::Relays(vec![RawRelay {
                    fingerprint: format!("F{}", id),
                    nickname: Some(format!("n{}", id)),
                    address: None,
                    country: Some("se".into()),
                }]),
            })
        };
        let engine = StubEngine {
            circuits: vec![circuit("b", 2_000.0), circuit("a", 1_000.0), circuit("c", 3_000.0)],
        };
        cache.set_engine(Some(Arc::new(engine) as Arc<dyn CircuitEngine>));

        let report = cache.refresh().await;
        assert_eq!(report.published, 3);
        assert_eq!(report.unresolved_hops, 0);

        let asc: Vec<String> = cache.circuits(SortOrder::Asc).into_iter().map(|c| c.id).collect();
        let desc: Vec<String> = cache.circuits(SortOrder::Desc).into_iter().map(|c| c.id).collect();
        assert_eq!(asc, vec!["a", "b", "c"]);
        assert_eq!(desc, vec!["c", "b", "a"]);
        assert_eq!(cache.newest_hops()[0].nickname, "nc");
        assert_eq!(cache.newest_hops()[0].country_name, "Sweden");
        assert_eq!(cache.circuits(SortOrder::Asc)[0].state, CircuitState::Established);
    }

    #[tokio::test]
    async fn test_first_seen_is_stable_across_cycles() {
        let (cache, _) = build_cache(Vec::new(), vec!["9 BUILT $AB~x PURPOSE=GENERAL"]);

        cache.refresh().await;
        let first = cache.circuits(SortOrder::Asc)[0].created_at;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.refresh().await;
        let second = cache.circuits(SortOrder::Asc)[0].created_at;

        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_overlapping_refresh_is_skipped() {
        let (cache, _) = build_cache(Vec::new(), Vec::new());
        cache.refreshing.store(true, Ordering::SeqCst);
        assert!(cache.refresh().await.skipped);
        cache.refreshing.store(false, Ordering::SeqCst);

        let report = cache.refresh().await;
        assert!(!report.skipped);
        assert_eq!(report.source, CircuitSourceKind::None);
        assert!(cache.circuits(SortOrder::Desc).is_empty());
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert_eq!("".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("sideways".parse::<SortOrder>().is_err());
    }
}
