//! The compiler-check cache.
//!
//! Detection probes and feature tests are keyed by a SHA-256 fingerprint
//! computed over separate digests of the argv, the compiler version, and
//! the test source, hashed together. The cache guarantees at most one real
//! process spawn per distinct fingerprint per workspace lifetime and is
//! persisted alongside the workspace option store.

use std::collections::HashMap;
use std::process::Command;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckCacheError {
    #[error("failed to spawn {argv:?}: {source}")]
    Spawn {
        argv: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist check cache: {0}")]
    Persist(#[from] std::io::Error),
}

/// A recorded process result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckRecord {
    pub success: bool,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Default)]
pub struct CheckCache {
    entries: HashMap<String, CheckRecord>,
    spawns: usize,
}

impl CheckCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content-address a check. The three inputs are digested separately
    /// so a one-byte change in any of them changes the key.
    #[must_use]
    pub fn fingerprint(argv: &[String], version: &str, source: &[u8]) -> String {
        let mut argv_hash = Sha256::new();
        for arg in argv {
            argv_hash.update(arg.as_bytes());
            argv_hash.update([0]);
        }
        let mut version_hash = Sha256::new();
        version_hash.update(version.as_bytes());
        let mut source_hash = Sha256::new();
        source_hash.update(source);

        let mut outer = Sha256::new();
        outer.update(argv_hash.finalize());
        outer.update(version_hash.finalize());
        outer.update(source_hash.finalize());
        format!("{:x}", outer.finalize())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CheckRecord> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, record: CheckRecord) {
        self.entries.insert(key, record);
    }

    /// Number of real processes spawned through this cache.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawns
    }

    /// Run `argv`, consulting the cache first. `version` and `source`
    /// extend the fingerprint for feature checks.
    pub fn run_cached(
        &mut self,
        argv: &[String],
        version: &str,
        source: &[u8],
    ) -> Result<CheckRecord, CheckCacheError> {
        let key = Self::fingerprint(argv, version, source);
        if let Some(found) = self.entries.get(&key) {
            return Ok(found.clone());
        }
        let record = self.spawn(argv)?;
        self.entries.insert(key, record.clone());
        Ok(record)
    }

    fn spawn(&mut self, argv: &[String]) -> Result<CheckRecord, CheckCacheError> {
        let Some((program, rest)) = argv.split_first() else {
            return Err(CheckCacheError::Spawn {
                argv: argv.to_vec(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };
        self.spawns += 1;
        let output = Command::new(program)
            .args(rest)
            .output()
            .map_err(|source| CheckCacheError::Spawn { argv: argv.to_vec(), source })?;
        let status = output.status.code().unwrap_or(-1);
        Ok(CheckRecord {
            success: status == 0,
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Load persisted results; a missing or malformed file is an empty
    /// cache.
    pub fn load(&mut self, path: &Utf8Path) {
        let Ok(text) = std::fs::read_to_string(path) else { return };
        if let Ok(entries) = serde_json::from_str::<HashMap<String, CheckRecord>>(&text) {
            self.entries.extend(entries);
        } else {
            tracing::debug!(%path, "discarding malformed check cache");
        }
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), CheckCacheError> {
        let text = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| CheckCacheError::Persist(std::io::Error::other(e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| (*p).to_owned()).collect()
    }

    #[rstest]
    fn identical_inputs_share_a_fingerprint() {
        let a = CheckCache::fingerprint(&argv(&["cc", "--version"]), "1.0", b"src");
        let b = CheckCache::fingerprint(&argv(&["cc", "--version"]), "1.0", b"src");
        assert_eq!(a, b);
    }

    #[rstest]
    fn single_byte_source_change_changes_the_key() {
        let a = CheckCache::fingerprint(&argv(&["cc"]), "1.0", b"int main;");
        let b = CheckCache::fingerprint(&argv(&["cc"]), "1.0", b"int mair;");
        assert_ne!(a, b);
    }

    #[rstest]
    fn argv_boundaries_are_unambiguous() {
        // ["ab", "c"] must not collide with ["a", "bc"].
        let a = CheckCache::fingerprint(&argv(&["ab", "c"]), "", b"");
        let b = CheckCache::fingerprint(&argv(&["a", "bc"]), "", b"");
        assert_ne!(a, b);
    }

    #[rstest]
    fn second_identical_run_spawns_no_process() {
        let mut cache = CheckCache::new();
        let cmd = argv(&["sh", "-c", "echo hi"]);
        let first = cache.run_cached(&cmd, "", b"").expect("run");
        assert_eq!(cache.spawn_count(), 1);
        let second = cache.run_cached(&cmd, "", b"").expect("run");
        assert_eq!(cache.spawn_count(), 1);
        assert_eq!(first, second);
        assert!(first.stdout.contains("hi"));
    }

    #[rstest]
    fn roundtrips_through_disk(#[values(true)] _x: bool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("cache.json"))
            .expect("utf8 path");
        let mut cache = CheckCache::new();
        cache.insert(
            "k".into(),
            CheckRecord { success: true, status: 0, stdout: "out".into(), stderr: String::new() },
        );
        cache.save(&path).expect("save");
        let mut reloaded = CheckCache::new();
        reloaded.load(&path);
        assert_eq!(reloaded.get("k").map(|r| r.status), Some(0));
    }
}
