//! Canonical circuit records and normalization of raw inputs.
//!
//! Circuits reach the sidecar in two shapes: lines parsed from the control
//! port's `circuit-status` reply, and records reported by the circuit engine
//! collaborator. Both are expressed as a [`RawCircuit`] variant and turned
//! into a [`CircuitRecord`] by [`normalize`], the only place where upstream
//! field shapes are interpreted.
//!
//! # Hop Roles
//!
//! A hop's role is derived from its position and nothing else:
//!
//! ```text
//!   1 hop:   [exit]
//!   2 hops:  [entry, exit]
//!   3 hops:  [entry, middle, exit]
//!   n hops:  [entry, middle × (n-2), exit]
//! ```

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Purpose tag of circuits retained in the published view.
pub const GENERIC_PURPOSE: &str = "GENERAL";

/// Position of a hop within its circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopRole {
    /// First hop of a multi-hop circuit.
    Entry,
    /// Any hop strictly between the first and the last.
    Middle,
    /// Last hop; also the role of a single-hop path.
    Exit,
}

impl HopRole {
    /// Returns the role of hop `index` in a path of `len` hops.
    ///
    /// ```rust
    /// use circuit_sidecar::HopRole;
    ///
    /// assert_eq!(HopRole::for_position(0, 1), HopRole::Exit);
    /// assert_eq!(HopRole::for_position(1, 3), HopRole::Middle);
    /// ```
    pub fn for_position(index: usize, len: usize) -> Self {
        if len <= 1 || index + 1 >= len {
            HopRole::Exit
        } else if index == 0 {
            HopRole::Entry
        } else {
            HopRole::Middle
        }
    }
}

/// Lifecycle state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Launched or still extending.
    Building,
    /// Usable: built, ready, open or established.
    Established,
    /// Closing, closed or failed.
    Closing,
    /// Anything else.
    Unknown,
}

impl CircuitState {
    /// Maps an upstream status spelling onto a lifecycle state.
    ///
    /// Matching is case-insensitive and by prefix, so `BUILT`, `ready`,
    /// `OPEN`, `ESTABLISHED` and `Established_OK` are all established.
    pub fn from_status(status: &str) -> Self {
        let upper = status.trim().to_ascii_uppercase();
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| upper.starts_with(p));
        if starts(&["BUILT", "READY", "OPEN", "ESTABLISH"]) {
            CircuitState::Established
        } else if starts(&["LAUNCHED", "EXTENDED", "BUILDING", "EXTENDING", "PENDING"]) {
            CircuitState::Building
        } else if starts(&["CLOS", "FAILED", "DESTROY"]) {
            CircuitState::Closing
        } else {
            CircuitState::Unknown
        }
    }

    /// Returns `true` for [`CircuitState::Established`].
    pub fn is_established(self) -> bool {
        self == CircuitState::Established
    }
}

/// One relay in a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Role derived from position.
    pub role: HopRole,
    /// Upper-case hex relay identity fingerprint.
    pub fingerprint: String,
    /// Relay nickname, empty when unknown.
    pub nickname: String,
    /// Relay address, empty when unknown.
    #[serde(rename = "ip")]
    pub address: String,
    /// Upper-case two-letter country code, empty when unresolved.
    pub country_code: String,
    /// English country name, empty when unresolved.
    pub country_name: String,
}

/// Canonical, normalized circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Circuit identifier.
    pub id: String,
    /// Lifecycle state.
    pub state: CircuitState,
    /// Upstream status spelling, kept for display.
    pub status: String,
    /// Upper-case purpose tag.
    pub purpose: String,
    /// Creation time in epoch seconds. Filled with the local first-seen time
    /// when upstream gave none.
    #[serde(rename = "first_seen_ts")]
    pub created_at: Option<f64>,
    /// Ordered hops.
    pub hops: Vec<Hop>,
}

impl CircuitRecord {
    /// Returns `true` if the purpose is the generic tag.
    pub fn is_generic(&self) -> bool {
        self.purpose.is_empty() || self.purpose.eq_ignore_ascii_case(GENERIC_PURPOSE)
    }

    /// Seconds since creation at `now` (epoch seconds), never negative.
    pub fn age_seconds(&self, now: f64) -> f64 {
        self.created_at.map(|t| (now - t).max(0.0)).unwrap_or(0.0)
    }

    /// Sort key: creation time, unknown sorting first.
    pub fn sort_key(&self) -> f64 {
        self.created_at.unwrap_or(0.0)
    }
}

/// A relay reference inside a raw engine record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRelay {
    /// Fingerprint, possibly `$`-prefixed or lower-case.
    pub fingerprint: String,
    /// Nickname if reported.
    pub nickname: Option<String>,
    /// Address if reported.
    pub address: Option<String>,
    /// Country code if reported.
    pub country: Option<String>,
}

/// How the engine reported a circuit's path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPath {
    /// Structured relay records.
    Relays(Vec<RawRelay>),
    /// A `fp~nick,fp~nick` route string.
    Route(String),
}

/// How the engine reported a creation time.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    /// Numeric epoch; values above 10^12 are milliseconds, else seconds.
    Epoch(f64),
    /// RFC 3339 or `YYYY-MM-DD[T ]HH:MM:SS[.frac]` (UTC) text.
    Text(String),
}

/// A circuit record as reported by the circuit engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCircuit {
    /// Identifier, if the engine reported one.
    pub id: Option<String>,
    /// Upstream status spelling.
    pub status: String,
    /// Purpose tag, if reported.
    pub purpose: Option<String>,
    /// Creation time, if reported.
    pub created: Option<RawTimestamp>,
    /// Path.
    pub path: RawPath,
}

/// Closed set of raw circuit inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCircuit {
    /// Already parsed from `circuit-status` text.
    Parsed(CircuitRecord),
    /// Reported by the circuit engine.
    Engine(EngineCircuit),
}

/// Upper-cases a fingerprint and strips the `$` sigil.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.trim().trim_start_matches('$').to_ascii_uppercase()
}

/// Builds positional hops from `(fingerprint, nickname)` pairs.
///
/// Entries with an empty fingerprint are dropped before roles are assigned.
pub fn hops_from_pairs<I>(pairs: I) -> Vec<Hop>
where
    I: IntoIterator<Item = (String, String)>,
{
    let pairs: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(fp, nick)| (normalize_fingerprint(&fp), nick))
        .filter(|(fp, _)| !fp.is_empty())
        .collect();
    let len = pairs.len();
    pairs
        .into_iter()
        .enumerate()
        .map(|(i, (fingerprint, nickname))| Hop {
            role: HopRole::for_position(i, len),
            fingerprint,
            nickname,
            address: String::new(),
            country_code: String::new(),
            country_name: String::new(),
        })
        .collect()
}

/// Parses one `fp~nick` / `$fp=nick` / `fp` path token.
pub fn split_path_token(token: &str) -> (String, String) {
    let token = token.trim().trim_start_matches('$');
    match token.find(['~', '=']) {
        Some(idx) => (
            token[..idx].trim().to_string(),
            token[idx + 1..].trim().to_string(),
        ),
        None => (token.to_string(), String::new()),
    }
}

/// Parses a comma-separated route string into positional hops.
pub fn hops_from_route(route: &str) -> Vec<Hop> {
    hops_from_pairs(
        route
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(split_path_token),
    )
}

/// Parses an upstream timestamp into epoch seconds.
///
/// Returns `None` for anything unparsable.
pub fn parse_timestamp(raw: &RawTimestamp) -> Option<f64> {
    match raw {
        RawTimestamp::Epoch(v) if v.is_finite() && *v > 0.0 => {
            Some(if *v > 1e12 { v / 1000.0 } else { *v })
        }
        RawTimestamp::Epoch(_) => None,
        RawTimestamp::Text(text) => parse_time_text(text),
    }
}

/// Parses RFC 3339 or a naive `YYYY-MM-DD[T ]HH:MM:SS[.frac]` in UTC.
pub fn parse_time_text(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(epoch_seconds(dt.with_timezone(&Utc)));
    }
    let normalized = text.replacen(' ', "T", 1);
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .map(|naive| epoch_seconds(naive.and_utc()))
}

fn epoch_seconds(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

/// Current wall-clock time in epoch seconds.
pub fn now_epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Converts a raw circuit into its canonical record.
///
/// Hop roles are recomputed from position, purposes are upper-cased with an
/// absent purpose becoming [`GENERIC_PURPOSE`], and relay details the engine
/// already knew (nickname, address, country) are carried over.
pub fn normalize(raw: RawCircuit) -> CircuitRecord {
    match raw {
        RawCircuit::Parsed(mut record) => {
            let len = record.hops.len();
            for (i, hop) in record.hops.iter_mut().enumerate() {
                hop.role = HopRole::for_position(i, len);
                hop.fingerprint = normalize_fingerprint(&hop.fingerprint);
            }
            record.purpose = normalize_purpose(Some(&record.purpose));
            record.state = CircuitState::from_status(&record.status);
            record
        }
        RawCircuit::Engine(circ) => {
            let hops = match circ.path {
                RawPath::Route(route) => hops_from_route(&route),
                RawPath::Relays(relays) => {
                    let relays: Vec<RawRelay> = relays
                        .into_iter()
                        .filter(|r| !normalize_fingerprint(&r.fingerprint).is_empty())
                        .collect();
                    let len = relays.len();
                    relays
                        .into_iter()
                        .enumerate()
                        .map(|(i, r)| Hop {
                            role: HopRole::for_position(i, len),
                            fingerprint: normalize_fingerprint(&r.fingerprint),
                            nickname: r.nickname.unwrap_or_default(),
                            address: r.address.unwrap_or_default().trim().to_string(),
                            country_code: r
                                .country
                                .map(|c| c.trim().to_ascii_uppercase())
                                .filter(|c| c.len() == 2)
                                .unwrap_or_default(),
                            country_name: String::new(),
                        })
                        .collect()
                }
            };
            CircuitRecord {
                id: circ.id.unwrap_or_default(),
                state: CircuitState::from_status(&circ.status),
                status: circ.status,
                purpose: normalize_purpose(circ.purpose.as_deref()),
                created_at: circ.created.as_ref().and_then(parse_timestamp),
                hops,
            }
        }
    }
}

fn normalize_purpose(purpose: Option<&str>) -> String {
    match purpose.map(str::trim) {
        Some(p) if !p.is_empty() => p.to_ascii_uppercase(),
        _ => GENERIC_PURPOSE.to_string(),
    }
}

/// Records the first time each circuit id was observed.
#[derive(Debug, Default)]
pub struct FirstSeen {
    seen: HashMap<String, f64>,
}

impl FirstSeen {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first-seen time of `id`, recording `now` if new.
    pub fn observe(&mut self, id: &str, now: f64) -> f64 {
        *self.seen.entry(id.to_string()).or_insert(now)
    }

    /// Fills a missing creation time with the record's first-seen time.
    ///
    /// Records without an id get `now`.
    pub fn stamp(&mut self, record: &mut CircuitRecord, now: f64) {
        let first_seen = if record.id.is_empty() {
            now
        } else {
            self.observe(&record.id, now)
        };
        if record.created_at.is_none() {
            record.created_at = Some(first_seen);
        }
    }

    /// Drops ids not in `live`.
    pub fn retain_live(&mut self, live: &HashSet<String>) {
        self.seen.retain(|id, _| live.contains(id));
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns `true` when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_positional() {
        let roles = |n: usize| -> Vec<HopRole> {
            (0..n).map(|i| HopRole::for_position(i, n)).collect()
        };
        assert_eq!(roles(1), vec![HopRole::Exit]);
        assert_eq!(roles(2), vec![HopRole::Entry, HopRole::Exit]);
        assert_eq!(
            roles(3),
            vec![HopRole::Entry, HopRole::Middle, HopRole::Exit]
        );
        assert_eq!(
            roles(4),
            vec![HopRole::Entry, HopRole::Middle, HopRole::Middle, HopRole::Exit]
        );
    }

    #[test]
    fn test_state_spellings() {
        for s in ["BUILT", "built", "READY", "Open", "ESTABLISHED", "established_ok"] {
            assert_eq!(CircuitState::from_status(s), CircuitState::Established, "{s}");
        }
        assert_eq!(CircuitState::from_status("EXTENDED"), CircuitState::Building);
        assert_eq!(CircuitState::from_status("CLOSED"), CircuitState::Closing);
        assert_eq!(CircuitState::from_status("FAILED"), CircuitState::Closing);
        assert_eq!(CircuitState::from_status("weird"), CircuitState::Unknown);
    }

    #[test]
    fn test_route_tokens() {
        assert_eq!(
            split_path_token("$AAAA~alice"),
            ("AAAA".to_string(), "alice".to_string())
        );
        assert_eq!(
            split_path_token("$BBBB=bob"),
            ("BBBB".to_string(), "bob".to_string())
        );
        assert_eq!(split_path_token("cccc"), ("cccc".to_string(), String::new()));

        let hops = hops_from_route("$aaaa~a, ,bbbb~b");
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].fingerprint, "AAAA");
        assert_eq!(hops[0].role, HopRole::Entry);
        assert_eq!(hops[1].role, HopRole::Exit);
    }

    #[test]
    fn test_normalize_engine_record() {
        let raw = RawCircuit::Engine(EngineCircuit {
            id: Some("7".into()),
            status: "ready".into(),
            purpose: None,
            created: Some(RawTimestamp::Epoch(1_700_000_000_000.0)),
            path: RawPath::Relays(vec![
                RawRelay {
                    fingerprint: "$aaaa".into(),
                    nickname: Some("a".into()),
                    address: Some(" 10.0.0.1 ".into()),
                    country: Some("de".into()),
                },
                RawRelay {
                    fingerprint: "".into(),
                    ..Default::default()
                },
                RawRelay {
                    fingerprint: "bbbb".into(),
                    ..Default::default()
                },
            ]),
        });
        let rec = normalize(raw);
        assert_eq!(rec.id, "7");
        assert_eq!(rec.state, CircuitState::Established);
        assert_eq!(rec.purpose, GENERIC_PURPOSE);
        assert_eq!(rec.created_at, Some(1_700_000_000.0));
        assert_eq!(rec.hops.len(), 2);
        assert_eq!(rec.hops[0].address, "10.0.0.1");
        assert_eq!(rec.hops[0].country_code, "DE");
        assert_eq!(rec.hops[1].role, HopRole::Exit);
    }

    #[test]
    fn test_normalize_reassigns_parsed_roles() {
        let mut hops = hops_from_route("A~a,B~b,C~c");
        hops[0].role = HopRole::Exit;
        let rec = normalize(RawCircuit::Parsed(CircuitRecord {
            id: "1".into(),
            state: CircuitState::Unknown,
            status: "BUILT".into(),
            purpose: "general".into(),
            created_at: None,
            hops,
        }));
        assert_eq!(rec.hops[0].role, HopRole::Entry);
        assert_eq!(rec.purpose, "GENERAL");
        assert!(rec.state.is_established());
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            parse_time_text("2024-01-02T03:04:05.500000"),
            Some(1_704_164_645.5)
        );
        assert_eq!(parse_time_text("2024-01-02 03:04:05"), Some(1_704_164_645.0));
        assert_eq!(parse_time_text("2024-01-02T03:04:05Z"), Some(1_704_164_645.0));
        assert_eq!(parse_time_text("yesterday"), None);
        assert_eq!(parse_timestamp(&RawTimestamp::Epoch(f64::NAN)), None);
        assert_eq!(parse_timestamp(&RawTimestamp::Epoch(42.0)), Some(42.0));
    }

    #[test]
    fn test_first_seen_stamping_and_pruning() {
        let mut seen = FirstSeen::new();
        let mut rec = normalize(RawCircuit::Engine(EngineCircuit {
            id: Some("9".into()),
            status: "BUILT".into(),
            purpose: None,
            created: Some(RawTimestamp::Text("garbage".into())),
            path: RawPath::Route(String::new()),
        }));
        seen.stamp(&mut rec, 100.0);
        assert_eq!(rec.created_at, Some(100.0));

        rec.created_at = None;
        seen.stamp(&mut rec, 200.0);
        assert_eq!(rec.created_at, Some(100.0));

        seen.retain_live(&HashSet::new());
        assert!(seen.is_empty());
    }
}
