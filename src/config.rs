//! Runtime configuration
//!
//! [`Config`] derives `clap::Args` so a host binary can flatten it into its
//! own command line. Every knob can also be set through a `PFS_*`
//! environment variable.

use clap::{Args, Parser};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct Config {
    /// Maximum number of filesets merged by a single compaction step
    #[arg(long, env = "PFS_COMPACTION_MAX_FAN_IN", default_value_t = 10)]
    pub compaction_max_fan_in: usize,

    /// Maximum number of bytes stored in one file content chunk
    #[arg(long, env = "PFS_CHUNK_SIZE", default_value_t = 1 << 20)]
    pub chunk_size: usize,

    /// Target size in bytes of one serialized index chunk
    #[arg(long, env = "PFS_INDEX_CHUNK_SIZE", default_value_t = 64 << 10)]
    pub index_chunk_size: usize,

    /// Number of ranges an index root may hold before another level is built
    #[arg(long, env = "PFS_INDEX_FANOUT", default_value_t = 128)]
    pub index_fanout: usize,

    /// Attempts made by a conflicting metadata transaction before giving up
    #[arg(long, env = "PFS_TXN_MAX_ATTEMPTS", default_value_t = 16)]
    pub txn_max_attempts: usize,

    /// Attempts made for every chunk store call
    #[arg(long, env = "PFS_CHUNK_RETRY_ATTEMPTS", default_value_t = 5)]
    pub chunk_retry_attempts: usize,

    /// Base backoff between chunk store attempts, doubled on every retry
    #[arg(long, env = "PFS_CHUNK_RETRY_BACKOFF_MS", default_value_t = 2)]
    pub chunk_retry_backoff_ms: u64,

    /// Attempts made by a background compaction before it is abandoned
    #[arg(long, env = "PFS_COMPACTION_RETRY_ATTEMPTS", default_value_t = 5)]
    pub compaction_retry_attempts: usize,
}

#[derive(Debug, Parser)]
#[command(name = "pfs")]
struct EnvOnly {
    #[command(flatten)]
    config: Config,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            compaction_max_fan_in: 10,
            chunk_size: 1 << 20,
            index_chunk_size: 64 << 10,
            index_fanout: 128,
            txn_max_attempts: 16,
            chunk_retry_attempts: 5,
            chunk_retry_backoff_ms: 2,
            compaction_retry_attempts: 5,
        }
    }
}

impl Config {
    /// Build a configuration from `PFS_*` environment variables alone.
    pub fn from_env() -> anyhow::Result<Self> {
        let parsed = EnvOnly::try_parse_from(["pfs"])?;
        parsed.config.validated()
    }

    /// Reject values the storage layer cannot work with.
    pub fn validated(self) -> anyhow::Result<Self> {
        if self.compaction_max_fan_in < 2 {
            anyhow::bail!(
                "compaction fan-in must be at least 2, got {}",
                self.compaction_max_fan_in
            );
        }
        if self.chunk_size == 0 || self.index_chunk_size == 0 {
            anyhow::bail!("chunk sizes must be positive");
        }
        if self.index_fanout < 2 {
            anyhow::bail!("index fanout must be at least 2, got {}", self.index_fanout);
        }
        if self.txn_max_attempts == 0 || self.chunk_retry_attempts == 0 {
            anyhow::bail!("retry attempts must be positive");
        }

        Ok(self)
    }

    pub fn chunk_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_declared_clap_defaults() {
        let parsed = EnvOnly::try_parse_from(["pfs"]).unwrap();

        // only holds when no PFS_* variable leaks in from the environment
        if std::env::vars().all(|(key, _)| !key.starts_with("PFS_")) {
            assert_eq!(parsed.config, Config::default());
        }
    }

    #[test]
    fn flags_override_defaults() {
        let parsed =
            EnvOnly::try_parse_from(["pfs", "--compaction-max-fan-in", "4", "--chunk-size", "64"])
                .unwrap();

        assert_eq!(parsed.config.compaction_max_fan_in, 4);
        assert_eq!(parsed.config.chunk_size, 64);
    }

    #[test]
    fn tiny_fan_in_is_rejected() {
        let config = Config {
            compaction_max_fan_in: 1,
            ..Config::default()
        };

        assert!(config.validated().is_err());
    }
}
