//! Relay directory: identity → relay metadata.
//!
//! The pipeline enriches hops from a [`RelayIndex`] built from whatever
//! [`RelayDirectory`] the process is wired to. [`ConsensusRelays`] is the
//! stock directory: it reads router status entries with `GETINFO ns/all`
//! over the shared control channel.
//!
//! # Router Status Format
//!
//! ```text
//! r <nickname> <identity> [<digest>] <date> <time> <address> <orport> <dirport>
//! s <Flag> <Flag> ...
//! w Bandwidth=<kb>
//! ```
//!
//! The identity is unpadded base64 of the 20-byte fingerprint.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};

use crate::config::LogLevel;
use crate::control::ControlChannel;
use crate::country::CountryCache;
use crate::error::Result;
use crate::logger::plog;

/// Deadline for `GETINFO ns/all`.
pub const CONSENSUS_TIMEOUT: Duration = Duration::from_secs(30);

/// One relay as known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Relay {
    /// Upper-case hex fingerprint.
    pub fingerprint: String,
    /// Relay nickname.
    pub nickname: String,
    /// OR address.
    pub address: String,
    /// OR port.
    pub or_port: u16,
    /// Consensus flags.
    pub flags: Vec<String>,
    /// Upper-case country code when already known.
    pub country: Option<String>,
}

impl Relay {
    /// Returns `true` if the relay carries the `Exit` flag.
    pub fn is_exit(&self) -> bool {
        self.flags.iter().any(|f| f == "Exit")
    }
}

/// Read-only lookup from fingerprint to relay, replaced wholesale on refresh.
#[derive(Debug, Clone, Default)]
pub struct RelayIndex {
    by_fingerprint: HashMap<String, Relay>,
}

impl RelayIndex {
    /// Builds an index keyed by upper-case fingerprint.
    pub fn from_relays(relays: impl IntoIterator<Item = Relay>) -> Self {
        let by_fingerprint = relays
            .into_iter()
            .filter(|r| !r.fingerprint.is_empty())
            .map(|r| (r.fingerprint.to_ascii_uppercase(), r))
            .collect();
        Self { by_fingerprint }
    }

    /// Looks up a relay by fingerprint, case-insensitive, `$` optional.
    pub fn get(&self, fingerprint: &str) -> Option<&Relay> {
        self.by_fingerprint
            .get(&crate::circuit::normalize_fingerprint(fingerprint))
    }

    /// Number of relays.
    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    /// Returns `true` when empty.
    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }

    /// Every known relay address.
    pub fn addresses(&self) -> Vec<String> {
        self.by_fingerprint
            .values()
            .filter(|r| !r.address.is_empty())
            .map(|r| r.address.clone())
            .collect()
    }

    /// `(address, country)` pairs for relays whose country is already known.
    pub fn known_countries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_fingerprint.values().filter_map(|r| {
            r.country
                .as_deref()
                .filter(|_| !r.address.is_empty())
                .map(|cc| (r.address.as_str(), cc))
        })
    }
}

/// Source of relay metadata.
#[async_trait]
pub trait RelayDirectory: Send + Sync {
    /// Current relays.
    async fn relays(&self) -> Result<Vec<Relay>>;

    /// Lower-case codes of countries that currently have usable exits.
    async fn available_countries(&self) -> Result<Vec<String>>;

    /// Re-reads relay metadata from the source.
    async fn refresh(&self) -> Result<()>;
}

/// Relay directory backed by the control port's router status entries.
pub struct ConsensusRelays {
    channel: ControlChannel,
    countries: Arc<CountryCache>,
    relays: Mutex<Arc<Vec<Relay>>>,
}

impl ConsensusRelays {
    /// Creates a directory; nothing is fetched until first use.
    pub fn new(channel: ControlChannel, countries: Arc<CountryCache>) -> Self {
        Self {
            channel,
            countries,
            relays: Mutex::new(Arc::new(Vec::new())),
        }
    }

    fn current(&self) -> Arc<Vec<Relay>> {
        self.relays
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl RelayDirectory for ConsensusRelays {
    async fn relays(&self) -> Result<Vec<Relay>> {
        if self.current().is_empty() {
            self.refresh().await?;
        }
        Ok(self
            .current()
            .iter()
            .cloned()
            .map(|mut relay| {
                if relay.country.is_none() {
                    relay.country = self.countries.cached(&relay.address);
                }
                relay
            })
            .collect())
    }

    async fn available_countries(&self) -> Result<Vec<String>> {
        let countries: BTreeSet<String> = self
            .relays()
            .await?
            .into_iter()
            .filter(Relay::is_exit)
            .filter_map(|r| r.country.map(|cc| cc.to_ascii_lowercase()))
            .collect();
        Ok(countries.into_iter().collect())
    }

    async fn refresh(&self) -> Result<()> {
        let text = self.channel.get_info("ns/all", CONSENSUS_TIMEOUT).await?;
        let relays = parse_network_statuses(&text);
        plog(
            LogLevel::Info,
            &format!("Loaded {} relays from router status entries", relays.len()),
        );
        match self.relays.lock() {
            Ok(mut guard) => *guard = Arc::new(relays),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(relays),
        }
        Ok(())
    }
}

/// Parses router status entries from a `GETINFO ns/all` reply.
///
/// Entries with an undecodable identity are skipped.
pub fn parse_network_statuses(response: &str) -> Vec<Relay> {
    let mut relays = Vec::new();
    let mut current: Option<Relay> = None;

    for raw in response.lines() {
        let line = raw.trim_end_matches('\r');
        let line = line
            .strip_prefix("250+ns/all=")
            .or_else(|| line.strip_prefix("250-"))
            .unwrap_or(line);

        if let Some(rest) = line.strip_prefix("r ") {
            if let Some(relay) = current.take() {
                relays.push(relay);
            }
            let parts: Vec<&str> = rest.split_whitespace().collect();
            // nickname identity [digest] date time address orport dirport
            if parts.len() < 7 {
                continue;
            }
            let Some(fingerprint) = decode_identity(parts[1]) else {
                continue;
            };
            let n = parts.len();
            current = Some(Relay {
                fingerprint,
                nickname: parts[0].to_string(),
                address: parts[n - 3].to_string(),
                or_port: parts[n - 2].parse().unwrap_or(0),
                flags: Vec::new(),
                country: None,
            });
        } else if let Some(flags) = line.strip_prefix("s ") {
            if let Some(relay) = current.as_mut() {
                relay.flags = flags.split_whitespace().map(str::to_string).collect();
            }
        }
    }

    if let Some(relay) = current {
        relays.push(relay);
    }
    relays
}

/// Decodes an unpadded base64 identity into an upper-case hex fingerprint.
pub fn decode_identity(b64: &str) -> Option<String> {
    let trimmed = b64.trim_end_matches('=');
    general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .ok()
        .filter(|bytes| !bytes.is_empty())
        .map(hex::encode_upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlEndpoint;

    const NS_REPLY: &str = "250+ns/all=\r\n\
r relay1 AAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 192.0.2.1 9001 0\r\n\
s Fast Guard Running Stable Valid\r\n\
w Bandwidth=1000\r\n\
r relay2 //////////////////////////8 DDDDDDDDDDDDDDDDDDDDDDDDDDD 2024-01-01 00:00:00 192.0.2.2 443 0\r\n\
s Exit Fast Running Stable Valid\r\n\
.\r\n\
250 OK\r\n";

    #[test]
    fn test_decode_identity() {
        assert_eq!(
            decode_identity("AAAAAAAAAAAAAAAAAAAAAAAAAAA").as_deref(),
            Some("0000000000000000000000000000000000000000")
        );
        assert_eq!(decode_identity("!!!"), None);
        assert_eq!(decode_identity(""), None);
    }

    #[test]
    fn test_parse_network_statuses() {
        let relays = parse_network_statuses(NS_REPLY);
        assert_eq!(relays.len(), 2);

        assert_eq!(relays[0].nickname, "relay1");
        assert_eq!(relays[0].address, "192.0.2.1");
        assert_eq!(relays[0].or_port, 9001);
        assert!(relays[0].flags.contains(&"Guard".to_string()));
        assert!(!relays[0].is_exit());

        assert_eq!(relays[1].fingerprint.len(), 40);
        assert!(relays[1].fingerprint.starts_with("FFFF"));
        assert!(relays[1].is_exit());
    }

    #[test]
    fn test_parse_microdesc_style_entry() {
        let relays = parse_network_statuses(
            "r m1 AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-01-01 00:00:00 198.51.100.4 9001 0\n",
        );
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].address, "198.51.100.4");
    }

    #[test]
    fn test_index_lookup_is_case_insensitive() {
        let index = RelayIndex::from_relays(vec![Relay {
            fingerprint: "ABCDEF".into(),
            nickname: "n".into(),
            address: "192.0.2.9".into(),
            country: Some("DE".into()),
            ..Relay::default()
        }]);
        assert_eq!(index.get("$abcdef").map(|r| r.nickname.as_str()), Some("n"));
        assert_eq!(index.addresses(), vec!["192.0.2.9".to_string()]);
        assert_eq!(
            index.known_countries().collect::<Vec<_>>(),
            vec![("192.0.2.9", "DE")]
        );
    }

    async fn ns_port() -> (ControlEndpoint, tempfile::NamedTempFile) {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let cookie = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(cookie.path(), [1u8; 32]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ControlEndpoint::new(listener.local_addr().unwrap(), cookie.path());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if line == "GETINFO ns/all" {
                    NS_REPLY
                } else {
                    "250 OK\r\n"
                };
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        (endpoint, cookie)
    }

    #[tokio::test]
    async fn test_available_countries_from_exits_with_cached_country() {
        let (endpoint, _cookie) = ns_port().await;
        let countries = Arc::new(CountryCache::new(Duration::from_secs(600), Vec::new()));
        countries.insert("192.0.2.1", "FR");
        countries.insert("192.0.2.2", "NL");
        let directory = ConsensusRelays::new(ControlChannel::new(endpoint), countries);

        assert_eq!(directory.available_countries().await.unwrap(), vec!["nl"]);
        let relays = directory.relays().await.unwrap();
        assert_eq!(relays[0].country.as_deref(), Some("FR"));
    }

    #[tokio::test]
    async fn test_relay_index_refresh_does_not_extend_country_ttl() {
        use crate::pipeline::{CircuitCache, RawCircuitStatus};

        let (endpoint, _cookie) = ns_port().await;
        let countries = Arc::new(CountryCache::new(Duration::from_secs(600), Vec::new()));
        let resolved_at = crate::country::now_ms() - 590_000;
        countries.insert_at("192.0.2.1", "FR", resolved_at);

        let directory = ConsensusRelays::new(ControlChannel::new(endpoint.clone()), countries.clone());
        let cache = CircuitCache::new(
            Arc::new(directory),
            countries.clone(),
            Arc::new(RawCircuitStatus::new(endpoint)),
        );

        assert_eq!(cache.refresh_relay_index().await.unwrap(), 2);
        assert_eq!(cache.refresh_relay_index().await.unwrap(), 2);
        assert_eq!(
            countries.entries_snapshot()["192.0.2.1"].timestamp_ms,
            resolved_at
        );
    }
}
