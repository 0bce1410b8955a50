//! Circuit engine collaborator.
//!
//! Circuit construction belongs to an external engine; the sidecar only
//! needs to start it with a target list, stop it, and list what it has
//! built. [`ControlPortEngine`] is the stock engine: it leaves building to
//! the daemon and observes circuits through `GETINFO circuit-status`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::circuit::RawCircuit;
use crate::config::LogLevel;
use crate::control::ControlChannel;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::parser::{extract_data_block, parse_circuit_status_lines};

/// Deadline for `GETINFO circuit-status` over the persistent channel.
pub const CIRCUIT_STATUS_TIMEOUT: Duration = Duration::from_secs(8);

/// Exit countries used when AUTO finds no available country.
pub const FALLBACK_EXIT_COUNTRIES: [&str; 4] = ["us", "de", "nl", "fr"];

/// Probe hosts used when no targets are configured.
pub const DEFAULT_TARGETS: [&str; 3] = ["ip-api.com", "api.ipify.org", "ipinfo.io"];

/// What the engine should keep circuits ready for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitTarget {
    /// Destination host.
    pub address: String,
    /// Acceptable exit countries, lower-case.
    pub exit_countries: Vec<String>,
    /// Circuits to keep at least.
    pub min_circuits: u32,
    /// Circuits to keep at most.
    pub max_circuits: u32,
    /// Path length, 2 or 3.
    pub hop_count: u8,
}

/// Clamps a hop count to the supported 2 or 3.
pub fn normalize_hop_count(hop_count: u8) -> u8 {
    if hop_count == 2 {
        2
    } else {
        3
    }
}

/// Builds one target per address.
///
/// An empty `exit_countries` means AUTO and is expanded to `available`, or to
/// [`FALLBACK_EXIT_COUNTRIES`] when that is empty too. An empty `addresses`
/// uses [`DEFAULT_TARGETS`].
///
/// ```rust
/// use circuit_sidecar::engine::build_targets;
///
/// let targets = build_targets(&[], 5, &[], &[], 1, 3);
/// assert_eq!(targets.len(), 3);
/// assert_eq!(targets[0].hop_count, 3);
/// assert_eq!(targets[0].exit_countries, vec!["us", "de", "nl", "fr"]);
/// ```
pub fn build_targets(
    addresses: &[String],
    hop_count: u8,
    exit_countries: &[String],
    available: &[String],
    min_circuits: u32,
    max_circuits: u32,
) -> Vec<CircuitTarget> {
    let lower = |list: &[String]| -> Vec<String> {
        list.iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    };

    let mut exits = lower(exit_countries);
    if exits.is_empty() {
        exits = lower(available);
    }
    if exits.is_empty() {
        exits = FALLBACK_EXIT_COUNTRIES.iter().map(|c| c.to_string()).collect();
    }

    let addresses: Vec<String> = if addresses.is_empty() {
        DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect()
    } else {
        addresses.to_vec()
    };

    let min_circuits = min_circuits.max(1);
    addresses
        .into_iter()
        .map(|address| CircuitTarget {
            address,
            exit_countries: exits.clone(),
            min_circuits,
            max_circuits: max_circuits.max(min_circuits),
            hop_count: normalize_hop_count(hop_count),
        })
        .collect()
}

/// A running circuit engine.
#[async_trait]
pub trait CircuitEngine: Send + Sync {
    /// Starts building toward the engine's targets.
    async fn initialize(&self) -> Result<()>;

    /// Stops the engine and releases what it holds.
    async fn shutdown(&self) -> Result<()>;

    /// Circuits the engine currently knows about.
    async fn list_circuits(&self) -> Result<Vec<RawCircuit>>;
}

/// Constructs engines for a target list.
pub trait EngineFactory: Send + Sync {
    /// Builds a fresh, not yet initialized engine.
    fn build(&self, targets: Vec<CircuitTarget>) -> Arc<dyn CircuitEngine>;
}

/// Observe-only engine over the control port.
pub struct ControlPortEngine {
    channel: ControlChannel,
    targets: Vec<CircuitTarget>,
}

impl ControlPortEngine {
    /// Creates an engine for `targets`.
    pub fn new(channel: ControlChannel, targets: Vec<CircuitTarget>) -> Self {
        Self { channel, targets }
    }

    /// Targets this engine was built for.
    pub fn targets(&self) -> &[CircuitTarget] {
        &self.targets
    }
}

#[async_trait]
impl CircuitEngine for ControlPortEngine {
    async fn initialize(&self) -> Result<()> {
        self.channel.ensure_connected().await?;
        for target in &self.targets {
            plog(
                LogLevel::Info,
                &format!(
                    "Engine target {}: {} hops, exits [{}], {}..{} circuits",
                    target.address,
                    target.hop_count,
                    target.exit_countries.join(","),
                    target.min_circuits,
                    target.max_circuits
                ),
            );
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        plog(LogLevel::Info, "Engine stopped");
        Ok(())
    }

    async fn list_circuits(&self) -> Result<Vec<RawCircuit>> {
        let text = self
            .channel
            .get_info("circuit-status", CIRCUIT_STATUS_TIMEOUT)
            .await
            .map_err(|e| Error::Engine(format!("circuit-status: {}", e)))?;
        Ok(
            parse_circuit_status_lines(extract_data_block(&text, "circuit-status"))
                .into_iter()
                .map(RawCircuit::Parsed)
                .collect(),
        )
    }
}

/// Builds [`ControlPortEngine`]s sharing one channel.
pub struct ControlPortEngineFactory {
    channel: ControlChannel,
}

impl ControlPortEngineFactory {
    /// Creates a factory.
    pub fn new(channel: ControlChannel) -> Self {
        Self { channel }
    }
}

impl EngineFactory for ControlPortEngineFactory {
    fn build(&self, targets: Vec<CircuitTarget>) -> Arc<dyn CircuitEngine> {
        Arc::new(ControlPortEngine::new(self.channel.clone(), targets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlEndpoint;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hop_count_normalization() {
        assert_eq!(normalize_hop_count(2), 2);
        assert_eq!(normalize_hop_count(3), 3);
        assert_eq!(normalize_hop_count(0), 3);
        assert_eq!(normalize_hop_count(7), 3);
    }

    #[test]
    fn test_build_targets_explicit_exits_lowercased() {
        let targets = build_targets(
            &strings(&["example.org"]),
            2,
            &strings(&["DE", " se "]),
            &strings(&["us"]),
            2,
            1,
        );
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address, "example.org");
        assert_eq!(targets[0].hop_count, 2);
        assert_eq!(targets[0].exit_countries, strings(&["de", "se"]));
        assert_eq!((targets[0].min_circuits, targets[0].max_circuits), (2, 2));
    }

    #[test]
    fn test_build_targets_auto_uses_available() {
        let targets = build_targets(&[], 3, &[], &strings(&["CH", "is"]), 1, 3);
        assert_eq!(targets.len(), DEFAULT_TARGETS.len());
        assert!(targets.iter().all(|t| t.exit_countries == strings(&["ch", "is"])));
    }

    #[tokio::test]
    async fn test_control_port_engine_lists_parsed_circuits() {
        let cookie = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(cookie.path(), [9u8; 32]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ControlEndpoint::new(listener.local_addr().unwrap(), cookie.path());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if line == "GETINFO circuit-status" {
                    "250+circuit-status=\r\n\
                     7 BUILT $AA~a,$BB~b,$CC~c PURPOSE=GENERAL\r\n\
                     8 BUILT $DD~d PURPOSE=HS_VANGUARDS\r\n\
                     .\r\n250 OK\r\n"
                } else {
                    "250 OK\r\n"
                };
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let factory = ControlPortEngineFactory::new(ControlChannel::new(endpoint));
        let engine = factory.build(build_targets(&[], 3, &[], &[], 1, 3));
        engine.initialize().await.unwrap();

        let circuits = engine.list_circuits().await.unwrap();
        assert_eq!(circuits.len(), 2);
        match &circuits[0] {
            RawCircuit::Parsed(record) => {
                assert_eq!(record.id, "7");
                assert_eq!(record.hops.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown().await.unwrap();
    }
}
