//! Persistent per-key usage counters.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Cumulative usage for one API key
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct KeyUsage {
    pub total_tokens: u64,
    pub total_requests: u64,
    /// Unix epoch seconds of the most recent request with this key
    pub last_used: f64,
}

/// Map of key -> cumulative usage, saved to disk after every update.
///
/// A missing or unreadable state file is treated as empty so a corrupt
/// write never prevents startup.
pub struct UsageLedger {
    path: PathBuf,
    entries: HashMap<String, KeyUsage>,
}

impl UsageLedger {
    /// Load the ledger from `path`, falling back to an empty one.
    pub fn open(path: PathBuf) -> Self {
        let entries = match load_entries(&path) {
            Ok(entries) => entries,
            Err(err) => {
                if path.exists() {
                    warn!("starting with an empty usage ledger: {:#}", err);
                }
                HashMap::new()
            }
        };
        Self { path, entries }
    }

    /// Default on-disk location under the platform data directory.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("voicepipe");
        path.push("key_usage.json");
        path
    }

    /// Cumulative usage recorded for `key` (zeroes if never used).
    pub fn usage(&self, key: &str) -> KeyUsage {
        self.entries.get(key).copied().unwrap_or_default()
    }

    /// Record one request of `tokens` tokens at `now` and persist.
    pub fn record(&mut self, key: &str, tokens: u64, now: f64) {
        let entry = self.entries.entry(key.to_string()).or_default();
        entry.total_tokens += tokens;
        entry.total_requests += 1;
        entry.last_used = now;
        if let Err(err) = self.save() {
            warn!("failed to save usage ledger: {:#}", err);
        }
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(&self.entries)
            .context("serializing usage ledger")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<HashMap<String, KeyUsage>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let entries =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::open(dir.path().join("nope.json"));
        assert_eq!(ledger.usage("k").total_requests, 0);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let ledger = UsageLedger::open(path);
        assert_eq!(ledger.usage("k").total_tokens, 0);
    }

    #[test]
    fn record_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut ledger = UsageLedger::open(path.clone());
        ledger.record("AIzaTest", 120, 1_700_000_000.0);
        ledger.record("AIzaTest", 80, 1_700_000_030.0);

        let reopened = UsageLedger::open(path);
        let usage = reopened.usage("AIzaTest");
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.total_tokens, 200);
        assert_eq!(usage.last_used, 1_700_000_030.0);
    }
}
