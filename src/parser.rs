//! Pure parsers for control protocol reply text.
//!
//! Nothing in this module performs I/O or raises errors: malformed input is
//! skipped and unresolvable values come back empty. Callers treat empty as
//! "unknown".
//!
//! # Reply Grammar
//!
//! ```text
//!   250-key=value          mid-reply line
//!   250+key=               data section follows, ends with a lone "."
//!   line one
//!   ..dot-stuffed line
//!   .
//!   250 OK                 final line: the reply terminator
//! ```
//!
//! A reply block always ends at a line whose fourth byte is a space.

use crate::circuit::{
    hops_from_pairs, parse_time_text, split_path_token, CircuitRecord, CircuitState,
    GENERIC_PURPOSE,
};

/// One framed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBlock {
    /// Status code of the final line.
    pub code: u16,
    /// Raw text of the whole block, line endings included.
    pub text: String,
}

impl ReplyBlock {
    /// Returns `true` for a 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns `true` for an asynchronous event (6xx).
    pub fn is_async_event(&self) -> bool {
        (600..700).contains(&self.code)
    }

    /// The final line without its line ending.
    pub fn status_line(&self) -> &str {
        self.text
            .trim_end_matches(['\r', '\n'])
            .rsplit('\n')
            .next()
            .unwrap_or("")
            .trim_end_matches('\r')
    }
}

/// Result of scanning a buffer for the next reply block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete block occupying the first `consumed` bytes.
    Complete {
        /// The block.
        block: ReplyBlock,
        /// Bytes to drain from the buffer.
        consumed: usize,
    },
    /// More bytes are needed.
    Incomplete,
    /// A line that fits no reply grammar.
    Malformed(String),
}

/// Scans `buf` for the first complete reply block.
///
/// Only whole lines (ending in `\n`) are examined, so partial reads are
/// safe to feed repeatedly.
pub fn next_reply(buf: &str) -> Frame {
    let mut offset = 0;
    let mut in_data = false;

    while let Some(rel_end) = buf[offset..].find('\n') {
        let line_end = offset + rel_end + 1;
        let line = buf[offset..line_end].trim_end_matches(['\r', '\n']);
        offset = line_end;

        if in_data {
            if line == "." {
                in_data = false;
            }
            continue;
        }

        let bytes = line.as_bytes();
        if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_digit) {
                return Frame::Complete {
                    block: ReplyBlock {
                        code: line.parse().unwrap_or(0),
                        text: buf[..offset].to_string(),
                    },
                    consumed: offset,
                };
            }
            return Frame::Malformed(line.to_string());
        }

        match bytes[3] {
            b'-' => {}
            b'+' => in_data = true,
            b' ' => {
                let code = line[..3].parse().unwrap_or(0);
                return Frame::Complete {
                    block: ReplyBlock {
                        code,
                        text: buf[..offset].to_string(),
                    },
                    consumed: offset,
                };
            }
            _ => return Frame::Malformed(line.to_string()),
        }
    }

    Frame::Incomplete
}

/// Splits text into complete reply blocks, ignoring a trailing partial one.
pub fn split_replies(text: &str) -> Vec<ReplyBlock> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Frame::Complete { block, consumed } = next_reply(rest) {
        blocks.push(block);
        rest = &rest[consumed..];
    }
    blocks
}

/// Extracts the data lines of a `key` reply.
///
/// Returns the lines between the `NNN+key=` marker and the terminator, in
/// order, with `NNN-` continuation prefixes removed, dot-stuffing undone and
/// blank lines skipped. The single-line `NNN-key=value` form yields its
/// value. Returns an empty list when no marker is present.
///
/// ```rust
/// use circuit_sidecar::parser::extract_data_block;
///
/// let text = "250+circuit-status=\r\n1 BUILT $A~a PURPOSE=GENERAL\r\n.\r\n250 OK\r\n";
/// assert_eq!(
///     extract_data_block(text, "circuit-status"),
///     vec!["1 BUILT $A~a PURPOSE=GENERAL".to_string()]
/// );
/// ```
pub fn extract_data_block(text: &str, key: &str) -> Vec<String> {
    let marker = format!("{}=", key);
    let mut data = Vec::new();
    let mut in_block = false;

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');

        if !in_block {
            if line.len() > 4 && line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                let Some(body) = line.get(4..) else {
                    continue;
                };
                if let Some(inline) = body.strip_prefix(&marker) {
                    let inline = inline.trim();
                    if !inline.is_empty() {
                        data.push(inline.to_string());
                    }
                    if line.as_bytes()[3] == b'+' {
                        in_block = true;
                        continue;
                    }
                    break;
                }
            }
            continue;
        }

        if is_terminator(line) || line == "." {
            break;
        }
        let clean = strip_continuation(line);
        let clean = clean.strip_prefix('.').filter(|_| clean.starts_with("..")).unwrap_or(clean);
        if !clean.trim().is_empty() {
            data.push(clean.to_string());
        }
    }

    data
}

fn is_terminator(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' '
}

fn strip_continuation(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b'-' {
        &line[4..]
    } else {
        line
    }
}

/// Extracts a country code from an `ip-to-country` reply.
///
/// Tries, in order:
/// 1. `…/address=CC` anchored to the queried address
/// 2. any `key=CC`
/// 3. a bare two-letter line
///
/// Returns the upper-case code, or an empty string when nothing matched.
///
/// ```rust
/// use circuit_sidecar::parser::parse_address_to_country;
///
/// let reply = "250-ip-to-country/1.2.3.4=de\r\n250 OK\r\n";
/// assert_eq!(parse_address_to_country(reply, "1.2.3.4"), "DE");
/// assert_eq!(parse_address_to_country("552 Unrecognized key\r\n", "1.2.3.4"), "");
/// ```
pub fn parse_address_to_country(text: &str, address: &str) -> String {
    let anchored = format!("/{}=", address);
    if !address.is_empty() {
        for line in text.lines() {
            if let Some(idx) = line.find(&anchored) {
                if let Some(cc) = leading_country(&line[idx + anchored.len()..]) {
                    return cc;
                }
            }
        }
    }

    for line in text.lines() {
        for token in line.split_whitespace() {
            let token = strip_continuation(token);
            if let Some((_, value)) = token.rsplit_once('=') {
                if let Some(cc) = leading_country(value) {
                    return cc;
                }
            }
        }
    }

    for line in text.lines() {
        let line = line.trim();
        if line.len() == 2 && line.chars().all(|c| c.is_ascii_alphabetic()) {
            return line.to_ascii_uppercase();
        }
    }

    String::new()
}

/// Returns the two-letter code at the start of `value` if nothing but
/// whitespace follows it.
fn leading_country(value: &str) -> Option<String> {
    let value = value.trim();
    let cc = value.get(..2)?;
    let rest = &value[2..];
    if cc.chars().all(|c| c.is_ascii_alphabetic())
        && rest.chars().next().map_or(true, char::is_whitespace)
    {
        Some(cc.to_ascii_uppercase())
    } else {
        None
    }
}

/// Parses `circuit-status` data lines into records.
///
/// Each line is `<id> <state> [<path>] [KEY=VALUE ...]`. Lines with fewer
/// than two tokens are skipped. A missing `PURPOSE` defaults to
/// [`GENERIC_PURPOSE`]; `TIME_CREATED` fills the creation time.
///
/// ```rust
/// use circuit_sidecar::parser::parse_circuit_status_lines;
/// use circuit_sidecar::HopRole;
///
/// let recs = parse_circuit_status_lines(["5 BUILT $AA~x,$BB~y PURPOSE=GENERAL"]);
/// assert_eq!(recs[0].hops[0].role, HopRole::Entry);
/// assert_eq!(recs[0].hops[1].nickname, "y");
/// ```
pub fn parse_circuit_status_lines<I, S>(lines: I) -> Vec<CircuitRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_circuit_status_line(line.as_ref()))
        .collect()
}

fn parse_circuit_status_line(line: &str) -> Option<CircuitRecord> {
    let mut parts = line.split_whitespace();
    let id = parts.next()?;
    let status = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    let (path, keywords) = match rest.first() {
        Some(tok) if !tok.contains('=') || tok.starts_with('$') => (Some(*tok), &rest[1..]),
        _ => (None, &rest[..]),
    };

    let mut purpose = None;
    let mut created_at = None;
    for kv in keywords {
        if let Some((key, value)) = kv.split_once('=') {
            match key.to_ascii_uppercase().as_str() {
                "PURPOSE" if !value.is_empty() => purpose = Some(value.to_ascii_uppercase()),
                "TIME_CREATED" => created_at = parse_time_text(value),
                _ => {}
            }
        }
    }

    let hops = match path {
        Some(p) if p != "0" && !p.eq_ignore_ascii_case("UNKNOWN") => hops_from_pairs(
            p.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(split_path_token),
        ),
        _ => Vec::new(),
    };

    Some(CircuitRecord {
        id: id.to_string(),
        state: CircuitState::from_status(status),
        status: status.to_string(),
        purpose: purpose.unwrap_or_else(|| GENERIC_PURPOSE.to_string()),
        created_at,
        hops,
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::circuit::HopRole;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn data_block_extraction_preserves_lines(
            lines in prop::collection::vec("[A-Za-z][A-Za-z0-9$~,=_ ]{0,39}", 0..20),
            crlf in any::<bool>(),
        ) {
            let eol = if crlf { "\r\n" } else { "\n" };
            let expected: Vec<String> = lines
                .iter()
                .filter(|l| !l.trim().is_empty() && !l.starts_with('.'))
                .cloned()
                .collect();
            let mut text = format!("250+circuit-status={}", eol);
            for (i, line) in expected.iter().enumerate() {
                if i % 3 == 1 {
                    text.push_str("250-");
                }
                text.push_str(line);
                text.push_str(eol);
            }
            text.push_str(&format!(".{}250 OK{}", eol, eol));

            let got = extract_data_block(&text, "circuit-status");
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn hop_roles_depend_only_on_position(n in 1usize..8) {
            let path: Vec<String> = (0..n).map(|i| format!("$F{:02}~n{}", i, i)).collect();
            let line = format!("1 BUILT {} PURPOSE=GENERAL", path.join(","));
            let recs = parse_circuit_status_lines([line]);
            let roles: Vec<HopRole> = recs[0].hops.iter().map(|h| h.role).collect();
            prop_assert_eq!(roles.len(), n);
            prop_assert_eq!(roles[n - 1], HopRole::Exit);
            if n > 1 {
                prop_assert_eq!(roles[0], HopRole::Entry);
                prop_assert!(roles[1..n - 1].iter().all(|r| *r == HopRole::Middle));
            }
        }

        #[test]
        fn framing_never_panics(text in "[ -~\r\n]{0,200}") {
            let _ = next_reply(&text);
            let _ = split_replies(&text);
            let _ = parse_address_to_country(&text, "1.2.3.4");
        }

        #[test]
        fn parsing_unicode_never_panics(
            lines in prop::collection::vec(("[0-9]{3}", "\\PC{0,12}"), 0..12),
            key in "[a-z/-]{1,16}",
        ) {
            let text: String = lines
                .iter()
                .map(|(code, rest)| format!("{}{}\r\n", code, rest))
                .collect();
            let _ = next_reply(&text);
            let _ = split_replies(&text);
            let _ = extract_data_block(&text, &key);
            let _ = parse_address_to_country(&text, "1.2.3.4");
            let _ = parse_circuit_status_lines(text.lines());
        }
    }
}
