//! nftables script construction and invocation (spec §4.1 "Script Builder",
//! §4.2 "Table Registry & Applier" mechanics, §6).
//!
//! Every function in the `build_*`/`validate_*`/`sanitize_*` family is pure:
//! no I/O, no shared state. [`NftRunner`] is the thin subprocess wrapper the
//! gateway's table applier drives.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;

use thiserror::Error;
use tracing::{debug, warn};

const VALID_SET_FLAGS: &[&str] = &["constant", "interval", "timeout", "dynamic"];
const VALID_SET_TYPES: &[&str] = &[
    "ipv4_addr",
    "ipv6_addr",
    "inet_service",
    "ether_addr",
    "mark",
];
const VALID_CHAIN_TYPES: &[&str] = &["filter", "nat", "route"];
const VALID_HOOKS: &[&str] = &[
    "input", "output", "forward", "prerouting", "postrouting",
];
const VALID_POLICIES: &[&str] = &["accept", "drop"];

/// `true` iff `s` matches `[A-Za-z_][A-Za-z0-9_]*` and `|s| <= 64`.
pub fn validate_identifier(s: &str) -> bool {
    if s.is_empty() || s.len() > 64 {
        return false;
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `true` iff `s` parses as an IPv4/IPv6 address or CIDR.
pub fn validate_ip_or_cidr(s: &str) -> bool {
    if let Some((addr, prefix)) = s.split_once('/') {
        let Ok(parsed) = addr.parse::<std::net::IpAddr>() else {
            return false;
        };
        let Ok(prefix) = prefix.parse::<u8>() else {
            return false;
        };
        let max = if parsed.is_ipv4() { 32 } else { 128 };
        prefix <= max
    } else {
        s.parse::<std::net::IpAddr>().is_ok()
    }
}

/// Trims and removes CR, LF, `;`, `{`, `}`, `#`.
pub fn sanitize_element(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | ';' | '{' | '}' | '#'))
        .collect()
}

/// Replaces CR/LF with space, strips `#`, converts `"` to `'`.
pub fn sanitize_comment(s: &str) -> String {
    s.chars()
        .filter_map(|c| match c {
            '\r' | '\n' => Some(' '),
            '#' => None,
            '"' => Some('\''),
            other => Some(other),
        })
        .collect()
}

/// Build an nftables `set` declaration. Unknown identifiers/types/flags fall
/// back to known-safe sentinels rather than being emitted verbatim.
pub fn build_set(name: &str, set_type: &str, flags: &[&str], elements: &[&str]) -> String {
    let name = if validate_identifier(name) {
        name
    } else {
        "invalid_set"
    };
    let set_type = if VALID_SET_TYPES.contains(&set_type) {
        set_type
    } else {
        "ipv4_addr"
    };
    let flags: Vec<&str> = flags
        .iter()
        .filter(|f| VALID_SET_FLAGS.contains(f))
        .copied()
        .collect();

    let sanitized: Vec<String> = elements
        .iter()
        .map(|e| sanitize_element(e))
        .filter(|e| !e.is_empty())
        .collect();

    let mut out = format!("set {name} {{\n    type {set_type}\n");
    if !flags.is_empty() {
        out.push_str(&format!("    flags {}\n", flags.join(", ")));
    }
    if !sanitized.is_empty() {
        out.push_str(&format!("    elements = {{ {} }}\n", sanitized.join(", ")));
    }
    out.push_str("}\n");
    out
}

/// Build an nftables base-chain declaration. Unknown chain-type/hook/policy
/// fall back to known-safe sentinels.
pub fn build_chain(
    name: &str,
    chain_type: &str,
    hook: &str,
    priority: i32,
    policy: &str,
    rules: &[&str],
) -> String {
    let name = if validate_identifier(name) {
        name
    } else {
        "invalid_chain"
    };
    let chain_type = if VALID_CHAIN_TYPES.contains(&chain_type) {
        chain_type
    } else {
        "filter"
    };
    let hook = if VALID_HOOKS.contains(&hook) {
        hook
    } else {
        "input"
    };
    let policy = if VALID_POLICIES.contains(&policy) {
        policy
    } else {
        "drop"
    };

    let mut out = format!(
        "chain {name} {{\n    type {chain_type} hook {hook} priority {priority}; policy {policy};\n"
    );
    for rule in rules {
        let collapsed: String = rule.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        out.push_str(&format!("    {collapsed}\n"));
    }
    out.push_str("}\n");
    out
}

/// State machine over `nft list set` text output, counting non-empty
/// comma-separated elements of the named set.
pub fn parse_set_element_count(listing: &str, set_name: &str) -> usize {
    #[derive(PartialEq)]
    enum State {
        Outside,
        InSet,
        InElements,
    }

    let mut state = State::Outside;
    let mut count = 0usize;

    for line in listing.lines() {
        let trimmed = line.trim();
        match state {
            State::Outside => {
                if trimmed.starts_with("set ") && trimmed.contains(set_name) {
                    state = State::InSet;
                }
            }
            State::InSet => {
                if trimmed.starts_with("elements") {
                    state = State::InElements;
                    if let Some(rest) = trimmed.split_once('{') {
                        count += count_items(rest.1.trim_end_matches('}'));
                        if trimmed.contains('}') {
                            state = State::InSet;
                        }
                    }
                } else if trimmed == "}" {
                    state = State::Outside;
                }
            }
            State::InElements => {
                if trimmed.contains('}') {
                    let before = trimmed.split('}').next().unwrap_or("");
                    count += count_items(before);
                    state = State::InSet;
                } else {
                    count += count_items(trimmed);
                }
            }
        }
    }

    count
}

fn count_items(s: &str) -> usize {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .count()
}

/// Errors invoking the kernel packet-filter tool.
#[derive(Debug, Error)]
pub enum NftError {
    #[error("failed to write script file: {0}")]
    Io(#[from] std::io::Error),

    #[error("nft exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
}

/// Thin subprocess wrapper around the `nft` binary (spec §6).
pub struct NftRunner {
    binary: String,
}

impl Default for NftRunner {
    fn default() -> Self {
        Self::new("nft")
    }
}

impl NftRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Write `script` to a mode-0600 temp file and invoke `nft -f <file>`.
    pub async fn apply_script(&self, script: &str) -> Result<(), NftError> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.as_file_mut()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        tmp.write_all(script.as_bytes())?;
        tmp.flush()?;

        let path = tmp.path().to_owned();
        let output = tokio::process::Command::new(&self.binary)
            .arg("-f")
            .arg(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(status = ?output.status.code(), %stderr, "nft -f failed");
            return Err(NftError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        debug!("nft -f applied successfully");
        Ok(())
    }

    /// `nft list table <family> <table>` (or `list set ... <set>` when `set_name` is given).
    pub async fn list(
        &self,
        family: &str,
        table: &str,
        set_name: Option<&str>,
    ) -> Result<String, NftError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("list");
        match set_name {
            Some(set_name) => {
                cmd.arg("set").arg(family).arg(table).arg(set_name);
            }
            None => {
                cmd.arg("table").arg(family).arg(table);
            }
        }
        let output = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(NftError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("abc", true ; "plain identifier")]
    #[test_case("_abc123", true ; "leading underscore")]
    #[test_case("1abc", false ; "leading digit")]
    #[test_case("", false ; "empty")]
    #[test_case("abc def", false ; "space")]
    fn test_validate_identifier(s: &str, expected: bool) {
        assert_eq!(validate_identifier(s), expected);
    }

    #[test_case("10.0.0.1", true ; "ipv4")]
    #[test_case("10.0.0.0/24", true ; "ipv4 cidr")]
    #[test_case("::1", true ; "ipv6")]
    #[test_case("not an ip", false ; "garbage")]
    #[test_case("10.0.0.0/99", false ; "bad prefix")]
    fn test_validate_ip_or_cidr(s: &str, expected: bool) {
        assert_eq!(validate_ip_or_cidr(s), expected);
    }

    #[test]
    fn sanitize_element_strips_control_chars() {
        assert_eq!(sanitize_element(" 10.0.0.1;{}#\r\n "), "10.0.0.1");
    }

    #[test]
    fn sanitize_comment_strips_hash_and_quotes() {
        assert_eq!(sanitize_comment("hello \"world\"\r\n#tag"), "hello 'world' tag");
    }

    // Testable property 1: for every printable ASCII string, build_set never
    // emits an unbalanced brace, a `#`, or a newline; and an invalid
    // identifier always falls back to `invalid_set`.
    #[test]
    fn injection_resistance_build_set() {
        let nasties = [
            "normal", "has space", "semi;colon", "brace{here}", "hash#tag", "line\nbreak",
            "", "a".repeat(100).leak() as &str,
        ];
        for s in nasties {
            let out = build_set("x", "ipv4_addr", &[], &[s]);
            assert!(!out.contains('#'));
            assert_eq!(out.matches('{').count(), out.matches('}').count());
        }
        assert!(build_set("1bad", "ipv4_addr", &[], &[]).contains("invalid_set"));
    }

    #[test]
    fn build_chain_falls_back_on_unknown_fields() {
        let out = build_chain("my_chain", "bogus", "bogus", 0, "bogus", &[]);
        assert!(out.contains("type filter"));
        assert!(out.contains("hook input"));
        assert!(out.contains("policy drop"));
    }

    #[test]
    fn build_chain_invalid_name_falls_back() {
        let out = build_chain("1bad", "filter", "input", 0, "drop", &[]);
        assert!(out.contains("invalid_chain"));
    }

    #[test]
    fn parse_set_element_count_counts_elements() {
        let listing = "table inet filter {\n\
            set blocked_ips {\n\
                type ipv4_addr\n\
                elements = { 10.0.0.1, 10.0.0.2,\n\
                10.0.0.3 }\n\
            }\n\
        }\n";
        assert_eq!(parse_set_element_count(listing, "blocked_ips"), 3);
    }

    #[test]
    fn parse_set_element_count_missing_set_is_zero() {
        let listing = "table inet filter {\n}\n";
        assert_eq!(parse_set_element_count(listing, "blocked_ips"), 0);
    }
}
