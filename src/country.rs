//! Address → country resolution with a TTL cache.
//!
//! Resolutions are a best-effort accelerator. A miss walks an ordered list of
//! [`CountryLookup`] strategies and caches the first non-empty answer; total
//! failure yields "unresolved", never an error that aborts the caller.
//!
//! # Lookup Order
//!
//! ```text
//!   resolve(addr)
//!        │
//!        ▼
//!   fresh entry? ──yes──▶ cached code
//!        │ no
//!        ▼
//!   ChannelLookup    (persistent control channel, 3 s)
//!        │ empty / error
//!        ▼
//!   StemLookup       (structured stem-rs client)
//!        │ empty / error
//!        ▼
//!   RawSocketLookup  (one-off connection, 1.5 s)
//!        │ empty / error
//!        ▼
//!   unresolved
//! ```
//!
//! # Cache File
//!
//! The sweep persists every resolution as JSON, merged over whatever the
//! file already held:
//!
//! ```json
//! { "198.51.100.7": { "country": "de", "timestamp": 1718000000000 } }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stem_rs::controller::Controller;
use tokio::task::JoinSet;

use crate::config::{CacheConfig, LogLevel};
use crate::control::{raw_exchange, ControlChannel, ControlEndpoint};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::parser::parse_address_to_country;

/// Deadline for a lookup over the persistent channel.
pub const CHANNEL_LOOKUP_TIMEOUT: Duration = Duration::from_millis(3000);

/// Deadline for a lookup through the structured client.
pub const STEM_LOOKUP_TIMEOUT: Duration = Duration::from_millis(3000);

/// Deadline for a lookup over a one-off socket.
pub const RAW_LOOKUP_TIMEOUT: Duration = Duration::from_millis(1500);

/// Sweep progress is logged every this many addresses.
const SWEEP_PROGRESS_EVERY: usize = 500;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The `GETINFO` key for an address.
pub fn country_key(address: &str) -> String {
    format!("ip-to-country/{}", address)
}

/// A cached resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryEntry {
    /// Upper-case two-letter code.
    pub code: String,
    /// When it was resolved, epoch milliseconds.
    pub timestamp_ms: u64,
}

/// On-disk form of a [`CountryEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedEntry {
    country: String,
    timestamp: u64,
}

/// One strategy for resolving an address.
///
/// Returns the upper-case code, or an empty string when the strategy got an
/// answer that names no country.
#[async_trait]
pub trait CountryLookup: Send + Sync {
    /// Short name used in logs and [`Resolution::Unresolved`].
    fn name(&self) -> &'static str;

    /// Resolves one address.
    async fn lookup(&self, address: &str) -> Result<String>;
}

/// Lookup over the shared persistent channel.
pub struct ChannelLookup {
    channel: ControlChannel,
    timeout: Duration,
}

impl ChannelLookup {
    /// Creates a lookup with [`CHANNEL_LOOKUP_TIMEOUT`].
    pub fn new(channel: ControlChannel) -> Self {
        Self {
            channel,
            timeout: CHANNEL_LOOKUP_TIMEOUT,
        }
    }
}

#[async_trait]
impl CountryLookup for ChannelLookup {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn lookup(&self, address: &str) -> Result<String> {
        let reply = self
            .channel
            .submit(&format!("GETINFO {}", country_key(address)), self.timeout)
            .await?;
        Ok(parse_address_to_country(&reply.text, address))
    }
}

/// Lookup through a short-lived stem-rs controller.
pub struct StemLookup {
    endpoint: ControlEndpoint,
}

impl StemLookup {
    /// Creates a lookup against `endpoint`.
    pub fn new(endpoint: ControlEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl CountryLookup for StemLookup {
    fn name(&self) -> &'static str {
        "stem"
    }

    async fn lookup(&self, address: &str) -> Result<String> {
        let query = async {
            let mut controller = Controller::from_port(self.endpoint.address).await?;
            controller.authenticate(None).await?;
            let value = controller.get_info(&country_key(address)).await?;
            Ok::<String, Error>(value)
        };
        let value = tokio::time::timeout(STEM_LOOKUP_TIMEOUT, query)
            .await
            .map_err(|_| Error::Timeout(format!("stem lookup of {}", address)))??;
        Ok(parse_address_to_country(&value, address))
    }
}

/// Lookup over a fresh one-off connection.
pub struct RawSocketLookup {
    endpoint: ControlEndpoint,
}

impl RawSocketLookup {
    /// Creates a lookup against `endpoint`.
    pub fn new(endpoint: ControlEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl CountryLookup for RawSocketLookup {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn lookup(&self, address: &str) -> Result<String> {
        let reply = raw_exchange(
            &self.endpoint,
            &format!("GETINFO {}", country_key(address)),
            RAW_LOOKUP_TIMEOUT,
        )
        .await?;
        Ok(parse_address_to_country(&reply.text, address))
    }
}

/// Walks `chain` in order and returns the first non-empty answer.
///
/// When nothing answers, the last error wins over an empty answer.
async fn first_answer(chain: &[Arc<dyn CountryLookup>], address: &str) -> Result<String> {
    let mut last = Ok(String::new());
    for lookup in chain {
        match lookup.lookup(address).await {
            Ok(code) if !code.is_empty() => return Ok(code),
            Ok(_) => {}
            Err(e) => last = Err(e),
        }
    }
    last
}

/// How a `resolve` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A fresh cache entry answered.
    Cached(String),
    /// A lookup strategy answered; the result is now cached.
    Resolved {
        /// Upper-case code.
        code: String,
        /// Name of the strategy that answered.
        via: &'static str,
    },
    /// Every strategy failed or came back empty.
    Unresolved {
        /// `(strategy, outcome)` per attempt.
        attempts: Vec<(&'static str, String)>,
    },
}

impl Resolution {
    /// The resolved code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Resolution::Cached(code) | Resolution::Resolved { code, .. } => Some(code),
            Resolution::Unresolved { .. } => None,
        }
    }
}

/// Summary of one background sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was running; nothing was done.
    pub skipped: bool,
    /// Addresses that needed a lookup.
    pub attempted: usize,
    /// Addresses that resolved.
    pub resolved: usize,
}

/// Clears the sweep flag when dropped.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// TTL map of address → country.
pub struct CountryCache {
    entries: Mutex<HashMap<String, CountryEntry>>,
    ttl: Duration,
    lookups: Vec<Arc<dyn CountryLookup>>,
    batch_size: usize,
    sweep_batch_size: usize,
    sweep_pacing: Duration,
    sweeping: AtomicBool,
    file: Option<PathBuf>,
}

impl std::fmt::Debug for CountryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountryCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .field(
                "lookups",
                &self.lookups.iter().map(|l| l.name()).collect::<Vec<_>>(),
            )
            .field("file", &self.file)
            .finish()
    }
}

impl CountryCache {
    /// Creates an empty cache with default batching.
    pub fn new(ttl: Duration, lookups: Vec<Arc<dyn CountryLookup>>) -> Self {
        let defaults = CacheConfig::default();
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            lookups,
            batch_size: defaults.batch_size,
            sweep_batch_size: defaults.sweep_batch_size,
            sweep_pacing: Duration::from_millis(defaults.sweep_pacing_ms),
            sweeping: AtomicBool::new(false),
            file: None,
        }
    }

    /// Creates a cache with the standard lookup chain and loads the cache
    /// file if it exists.
    pub fn from_config(
        config: &CacheConfig,
        channel: ControlChannel,
        endpoint: ControlEndpoint,
    ) -> Self {
        let lookups: Vec<Arc<dyn CountryLookup>> = vec![
            Arc::new(ChannelLookup::new(channel)),
            Arc::new(StemLookup::new(endpoint.clone())),
            Arc::new(RawSocketLookup::new(endpoint)),
        ];
        let cache = Self::new(Duration::from_secs(config.country_ttl_secs), lookups)
            .with_batching(
                config.batch_size,
                config.sweep_batch_size,
                Duration::from_millis(config.sweep_pacing_ms),
            )
            .with_file(config.file.clone());

        match cache.load(&config.file) {
            Ok(0) => {}
            Ok(n) => plog(
                LogLevel::Info,
                &format!(
                    "Loaded {} country resolutions from {}",
                    n,
                    config.file.display()
                ),
            ),
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => plog(
                LogLevel::Warn,
                &format!("Ignoring country cache {}: {}", config.file.display(), e),
            ),
        }
        cache
    }

    /// Overrides batch sizes and sweep pacing.
    pub fn with_batching(mut self, batch: usize, sweep_batch: usize, pacing: Duration) -> Self {
        self.batch_size = batch.max(1);
        self.sweep_batch_size = sweep_batch.max(1);
        self.sweep_pacing = pacing;
        self
    }

    /// Sets the file the sweep persists to.
    pub fn with_file(mut self, file: PathBuf) -> Self {
        self.file = Some(file);
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CountryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self, entry: &CountryEntry, now: u64) -> bool {
        now.saturating_sub(entry.timestamp_ms) < self.ttl.as_millis() as u64
    }

    /// Returns the fresh cached code for `address`.
    pub fn cached(&self, address: &str) -> Option<String> {
        let now = now_ms();
        self.entries()
            .get(address)
            .filter(|e| self.is_fresh(e, now))
            .map(|e| e.code.clone())
    }

    /// Records a resolution with an explicit timestamp.
    pub fn insert_at(&self, address: &str, code: &str, timestamp_ms: u64) {
        self.entries().insert(
            address.to_string(),
            CountryEntry {
                code: code.to_ascii_uppercase(),
                timestamp_ms,
            },
        );
    }

    /// Records a resolution made now.
    pub fn insert(&self, address: &str, code: &str) {
        self.insert_at(address, code, now_ms());
    }

    /// Number of entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// A copy of every entry.
    pub fn entries_snapshot(&self) -> HashMap<String, CountryEntry> {
        self.entries().clone()
    }

    /// Caches countries already known from relay metadata.
    ///
    /// Pairs with an empty address or a malformed code are skipped. An entry
    /// that already holds the same code keeps its timestamp, so seeding never
    /// extends a resolution's lifetime. Returns how many entries were written.
    pub fn seed<'a, I>(&self, known: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let now = now_ms();
        let mut entries = self.entries();
        let mut seeded = 0;
        for (address, code) in known {
            if address.is_empty() || !crate::config::is_valid_country_code(code) {
                continue;
            }
            if entries
                .get(address)
                .is_some_and(|e| e.code.eq_ignore_ascii_case(code))
            {
                continue;
            }
            entries.insert(
                address.to_string(),
                CountryEntry {
                    code: code.to_ascii_uppercase(),
                    timestamp_ms: now,
                },
            );
            seeded += 1;
        }
        seeded
    }

    /// Resolves `address`, reporting which path answered.
    pub async fn resolve_detailed(&self, address: &str) -> Resolution {
        if let Some(code) = self.cached(address) {
            return Resolution::Cached(code);
        }

        let mut attempts = Vec::new();
        for lookup in &self.lookups {
            match lookup.lookup(address).await {
                Ok(code) if !code.is_empty() => {
                    self.insert(address, &code);
                    return Resolution::Resolved {
                        code: code.to_ascii_uppercase(),
                        via: lookup.name(),
                    };
                }
                Ok(_) => attempts.push((lookup.name(), "no country".to_string())),
                Err(e) => attempts.push((lookup.name(), e.to_string())),
            }
        }
        plog(
            LogLevel::Debug,
            &format!("Country of {} unresolved: {:?}", address, attempts),
        );
        Resolution::Unresolved { attempts }
    }

    /// Resolves `address` to an upper-case code, or `None`.
    pub async fn resolve(&self, address: &str) -> Option<String> {
        self.resolve_detailed(address)
            .await
            .code()
            .map(str::to_string)
    }

    /// Resolves many addresses in bounded concurrent batches.
    ///
    /// Addresses with a fresh entry are skipped. Only the first lookup
    /// strategy is used; per-address failures are swallowed. Returns how many
    /// new resolutions were cached.
    pub async fn batch_resolve(&self, addresses: &[String]) -> usize {
        let pending = self.stale_addresses(addresses);
        let chain = self.lookups.iter().take(1).cloned().collect();
        self.resolve_in_batches(chain, pending, self.batch_size, Duration::ZERO, false)
            .await
    }

    /// Resolves addresses the primary strategy could not answer, walking the
    /// remaining strategies for each.
    ///
    /// Runs after [`batch_resolve`](Self::batch_resolve) in a cycle, so the
    /// primary is not asked again. Duplicates and fresh entries are skipped
    /// and lookups run in concurrent batches. Returns how many new
    /// resolutions were cached.
    pub async fn resolve_remaining(&self, addresses: &[String]) -> usize {
        let pending = self.stale_addresses(addresses);
        let chain: Vec<_> = self.lookups.iter().skip(1).cloned().collect();
        if pending.is_empty() || chain.is_empty() {
            return 0;
        }
        plog(
            LogLevel::Debug,
            &format!("Resolving {} addresses through fallback lookups", pending.len()),
        );
        self.resolve_in_batches(chain, pending, self.batch_size, Duration::ZERO, false)
            .await
    }

    fn stale_addresses(&self, addresses: &[String]) -> Vec<String> {
        let now = now_ms();
        let entries = self.entries();
        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        for address in addresses {
            if address.is_empty() || !seen.insert(address.as_str()) {
                continue;
            }
            if entries.get(address).is_some_and(|e| self.is_fresh(e, now)) {
                continue;
            }
            stale.push(address.clone());
        }
        stale
    }

    async fn resolve_in_batches(
        &self,
        chain: Vec<Arc<dyn CountryLookup>>,
        addresses: Vec<String>,
        batch_size: usize,
        pacing: Duration,
        log_progress: bool,
    ) -> usize {
        if chain.is_empty() {
            return 0;
        }
        let chain = Arc::new(chain);
        let total = addresses.len();
        let mut resolved = 0;
        let mut processed = 0;

        for (index, batch) in addresses.chunks(batch_size.max(1)).enumerate() {
            if index > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }

            let mut set = JoinSet::new();
            for address in batch {
                let chain = Arc::clone(&chain);
                let address = address.clone();
                set.spawn(async move {
                    let result = first_answer(&chain, &address).await;
                    (address, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                processed += 1;
                match joined {
                    Ok((address, Ok(code))) if !code.is_empty() => {
                        self.insert(&address, &code);
                        resolved += 1;
                    }
                    Ok((address, Err(e))) => plog(
                        LogLevel::Debug,
                        &format!("Batch lookup of {} failed: {}", address, e),
                    ),
                    Ok(_) => {}
                    Err(e) => plog(LogLevel::Debug, &format!("Batch lookup task failed: {}", e)),
                }
                if log_progress && processed % SWEEP_PROGRESS_EVERY == 0 {
                    plog(
                        LogLevel::Info,
                        &format!(
                            "Country sweep progress: {}/{} ({} resolved)",
                            processed, total, resolved
                        ),
                    );
                }
            }
        }
        resolved
    }

    /// Resolves every stale address in paced batches, then persists.
    ///
    /// Only one sweep runs at a time; an overlapping call returns a report
    /// with `skipped` set.
    pub async fn sweep(&self, addresses: &[String]) -> SweepReport {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            plog(LogLevel::Debug, "Country sweep already running");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }
        let _guard = SweepGuard(&self.sweeping);

        let pending = self.stale_addresses(addresses);
        let attempted = pending.len();
        plog(
            LogLevel::Info,
            &format!(
                "Country sweep starting: {} of {} addresses need lookup",
                attempted,
                addresses.len()
            ),
        );
        let resolved = self
            .resolve_in_batches(
                self.lookups.iter().take(1).cloned().collect(),
                pending,
                self.sweep_batch_size,
                self.sweep_pacing,
                true,
            )
            .await;
        plog(
            LogLevel::Notice,
            &format!(
                "Country sweep done: {}/{} resolved, {} cached",
                resolved,
                attempted,
                self.len()
            ),
        );

        if let Err(e) = self.persist_configured().await {
            plog(
                LogLevel::Warn,
                &format!("Cannot persist country cache: {}", e),
            );
        }

        SweepReport {
            skipped: false,
            attempted,
            resolved,
        }
    }

    /// Persists to the configured file, if any.
    ///
    /// The file work runs on the blocking pool against a copy of the entries.
    pub async fn persist_configured(&self) -> Result<()> {
        let Some(path) = self.file.clone() else {
            return Ok(());
        };
        let entries = self.entries_snapshot();
        tokio::task::spawn_blocking(move || write_merged(&path, &entries))
            .await
            .map_err(|e| Error::Cache(format!("persist task failed: {}", e)))?
    }

    /// Loads entries from `path`, keeping newer in-memory entries.
    ///
    /// Returns how many entries were taken from the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read or
    /// [`Error::Cache`] if it is not valid JSON.
    pub fn load(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let stored: BTreeMap<String, PersistedEntry> = serde_json::from_str(&content)?;
        let mut entries = self.entries();
        let mut loaded = 0;
        for (address, stored) in stored {
            if !crate::config::is_valid_country_code(&stored.country) {
                continue;
            }
            let newer = entries
                .get(&address)
                .is_some_and(|e| e.timestamp_ms >= stored.timestamp);
            if !newer {
                entries.insert(
                    address,
                    CountryEntry {
                        code: stored.country.to_ascii_uppercase(),
                        timestamp_ms: stored.timestamp,
                    },
                );
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Writes every entry to `path`, merged over the file's existing
    /// contents.
    ///
    /// The write is atomic (temp file + rename) and the file is created with
    /// mode 0600 on Unix. An unreadable existing file is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::Cache`] if writing fails.
    pub fn persist(&self, path: &Path) -> Result<()> {
        write_merged(path, &self.entries_snapshot())
    }
}

fn write_merged(path: &Path, entries: &HashMap<String, CountryEntry>) -> Result<()> {
    let mut merged: BTreeMap<String, PersistedEntry> = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();

    for (address, entry) in entries {
        merged.insert(
            address.clone(),
            PersistedEntry {
                country: entry.code.to_ascii_lowercase(),
                timestamp: entry.timestamp_ms,
            },
        );
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let temp_path = path.with_extension("tmp");

    #[cfg(unix)]
    let file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)?
    };

    #[cfg(not(unix))]
    let file = std::fs::File::create(&temp_path)?;

    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, &merged)?;
    writer.flush()?;
    drop(writer);

    std::fs::rename(&temp_path, path)?;
    plog(
        LogLevel::Debug,
        &format!(
            "Persisted {} country resolutions to {}",
            merged.len(),
            path.display()
        ),
    );
    Ok(())
}
