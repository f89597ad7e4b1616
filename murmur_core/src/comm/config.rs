//! Comm configuration.
//!
//! Tunables for the send window and the background flusher, loadable from
//! a TOML file or built in code. Every field has a default, so a partial
//! file (or an empty one) is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comm::frame::ELEMENT_SIZE;
use crate::error::{MurmurError, MurmurResult};

fn default_send_window_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_reclaim_idle_ms() -> u64 {
    10_000
}

/// Configuration for a [`GroupComm`](crate::comm::GroupComm).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Send window size W in bytes. Each of the two staging groups maps a
    /// region this large, split evenly across peers; a peer slot should
    /// comfortably hold a typical message plus header to avoid
    /// per-message flushes.
    #[serde(default = "default_send_window_bytes")]
    pub send_window_bytes: usize,

    /// Background flusher cadence in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Minimum idle time before a drained group's window is unmapped and
    /// remapped to hand pages back to the OS.
    #[serde(default = "default_reclaim_idle_ms")]
    pub reclaim_idle_ms: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            send_window_bytes: default_send_window_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            reclaim_idle_ms: default_reclaim_idle_ms(),
        }
    }
}

impl CommConfig {
    /// Config with an explicit window size and default timings.
    pub fn with_window(send_window_bytes: usize) -> Self {
        Self {
            send_window_bytes,
            ..Self::default()
        }
    }

    /// Load from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> MurmurResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: CommConfig = toml::from_str(&text)?;
        Ok(config)
    }

    /// Validate against a concrete group size.
    pub fn validate(&self, peers: usize) -> MurmurResult<()> {
        if self.send_window_bytes < peers * ELEMENT_SIZE {
            return Err(MurmurError::config(format!(
                "send window of {} bytes is smaller than {} peers x {}-byte element",
                self.send_window_bytes, peers, ELEMENT_SIZE
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(MurmurError::config("flush interval must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub(crate) fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = CommConfig::default();
        assert_eq!(config.send_window_bytes, 16 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 10);
        assert_eq!(config.reclaim_idle_ms, 10_000);
        assert!(config.validate(64).is_ok());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: CommConfig = toml::from_str("send_window_bytes = 4096").unwrap();
        assert_eq!(config.send_window_bytes, 4096);
        assert_eq!(config.flush_interval_ms, 10);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "send_window_bytes = 1048576").unwrap();
        writeln!(file, "flush_interval_ms = 5").unwrap();
        let config = CommConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.send_window_bytes, 1_048_576);
        assert_eq!(config.flush_interval_ms, 5);
        assert_eq!(config.reclaim_idle_ms, 10_000);
    }

    #[test]
    fn rejects_window_too_small_for_group() {
        let config = CommConfig::with_window(64);
        assert!(config.validate(4).is_ok());
        assert!(config.validate(16).is_err());
    }
}
