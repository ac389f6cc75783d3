//! OpenSSH `known_hosts` verification with trust-on-first-use.
//!
//! Supports plain hostnames, bracketed `[host]:port` matchers, and hashed
//! `|1|salt|hmac` matchers. The file is loaded eagerly at construction; the
//! only mutation ever performed is a trust-on-first-use append.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::io::Write;
use std::path::PathBuf;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
struct KnownHostEntry {
    matchers: Vec<String>,
    key_type: String,
    key_base64: String,
}

/// Outcome of a host-key check. `reason` is set iff `verified` is false.
#[derive(Debug, Clone)]
pub struct Verification {
    pub verified: bool,
    pub reason: Option<String>,
}

impl Verification {
    fn ok() -> Self {
        Self {
            verified: true,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            verified: false,
            reason: Some(reason),
        }
    }
}

pub struct HostKeyVerifier {
    path: PathBuf,
    trust_on_first_use: bool,
    entries: Vec<KnownHostEntry>,
}

impl HostKeyVerifier {
    /// Load a `known_hosts` file. A missing file is not an error — it is the
    /// normal starting state for trust-on-first-use.
    pub fn load(path: impl Into<PathBuf>, trust_on_first_use: bool) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_known_hosts(&contents),
            Err(e) => {
                tracing::debug!("known_hosts {} not readable: {}", path.display(), e);
                Vec::new()
            }
        };
        Self {
            path,
            trust_on_first_use,
            entries,
        }
    }

    /// Check a presented host key against the loaded entries.
    ///
    /// A key mismatch always wins over trust-on-first-use: a host with *any*
    /// entry on file is never silently re-trusted.
    pub fn verify(&mut self, host: &str, port: u16, key_type: &str, key: &[u8]) -> Verification {
        let probes = host_probes(host, port);
        let key_base64 = BASE64_STANDARD.encode(key);

        let matching: Vec<&KnownHostEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.matchers.iter().any(|m| matcher_matches(m, &probes)))
            .collect();

        if matching.is_empty() {
            if !self.trust_on_first_use {
                return Verification::rejected(format!(
                    "UNKNOWN HOST: {} is not present in {} and trust-on-first-use is \
                     disabled. Add the host key manually or set SSH_TRUST_ON_FIRST_USE=true.",
                    probes[0],
                    self.path.display()
                ));
            }
            return self.trust_first_use(host, port, key_type, &key_base64);
        }

        let identical = matching
            .iter()
            .any(|entry| entry.key_type == key_type && entry.key_base64 == key_base64);
        if identical {
            return Verification::ok();
        }

        Verification::rejected(format!(
            "HOST KEY MISMATCH for {}: the presented {} key does not match {}. \
             This may indicate a man-in-the-middle attack. If the host key \
             legitimately changed, remove the stale entry and reconnect.",
            probes[0],
            key_type,
            self.path.display()
        ))
    }

    fn trust_first_use(
        &mut self,
        host: &str,
        port: u16,
        key_type: &str,
        key_base64: &str,
    ) -> Verification {
        let matcher = if port == 22 {
            host.to_string()
        } else {
            format!("[{}]:{}", host, port)
        };
        let line = format!("{} {} {}", matcher, key_type, key_base64);

        match append_line(&self.path, &line) {
            Ok(()) => {
                tracing::info!("trust-on-first-use: saved host key for {}", matcher);
                self.entries.push(KnownHostEntry {
                    matchers: vec![matcher],
                    key_type: key_type.to_string(),
                    key_base64: key_base64.to_string(),
                });
                Verification::ok()
            }
            Err(e) => Verification::rejected(format!(
                "FAILED TO SAVE host key for {} to {}: {}",
                matcher,
                self.path.display(),
                e
            )),
        }
    }
}

/// The matcher strings that may name `host:port` in a known_hosts file.
/// Port 22 entries are stored as the bare hostname (normalised at parse).
fn host_probes(host: &str, port: u16) -> Vec<String> {
    if port == 22 {
        vec![host.to_string()]
    } else {
        vec![format!("[{}]:{}", host, port), host.to_string()]
    }
}

fn matcher_matches(matcher: &str, probes: &[String]) -> bool {
    if let Some(hashed) = matcher.strip_prefix("|1|") {
        return probes.iter().any(|probe| hashed_matches(hashed, probe));
    }
    probes.iter().any(|probe| matcher == probe)
}

/// `salt_b64|hash_b64` where `hash = HMAC-SHA1(salt, hostname)`.
fn hashed_matches(hashed: &str, probe: &str) -> bool {
    let Some((salt_b64, hash_b64)) = hashed.split_once('|') else {
        return false;
    };
    let Ok(salt) = BASE64_STANDARD.decode(salt_b64) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(probe.as_bytes());
    let digest = mac.finalize().into_bytes();
    BASE64_STANDARD.encode(digest) == hash_b64
}

fn parse_known_hosts(contents: &str) -> Vec<KnownHostEntry> {
    let mut entries = Vec::new();
    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            // @cert-authority / @revoked markers are out of scope.
            tracing::debug!("known_hosts line {}: skipping marker entry", lineno + 1);
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(matchers), Some(key_type), Some(key_base64)) =
            (fields.next(), fields.next(), fields.next())
        else {
            tracing::warn!("known_hosts line {}: malformed entry, skipped", lineno + 1);
            continue;
        };
        let matchers = matchers
            .split(',')
            .filter(|m| !m.is_empty())
            .map(normalize_matcher)
            .collect();
        entries.push(KnownHostEntry {
            matchers,
            key_type: key_type.to_string(),
            key_base64: key_base64.to_string(),
        });
    }
    entries
}

/// `[host]:22` collapses to `host`; every other form is kept verbatim.
fn normalize_matcher(matcher: &str) -> String {
    if let Some(stripped) = matcher.strip_suffix(":22") {
        if let Some(host) = stripped
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
        {
            return host.to_string();
        }
    }
    matcher.to_string()
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // If the file exists without a trailing newline, keep entries on their
    // own lines rather than gluing onto the last one.
    let needs_leading_newline = std::fs::read(path)
        .map(|bytes| !bytes.is_empty() && bytes.last() != Some(&b'\n'))
        .unwrap_or(false);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if needs_leading_newline {
        writeln!(file)?;
    }
    writeln!(file, "{}", line)?;
    Ok(())
}
