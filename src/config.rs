//! Engine configuration.

use std::time::Duration;

/// How redo log writes reach stable storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncMode {
    /// Every commit batch is fsynced before the commit is acknowledged.
    Instant,
    /// A background thread flushes and fsyncs on a fixed interval;
    /// commits acknowledged between flushes may be lost on crash.
    Periodic,
    /// No redo log at all. Data survives only through explicit saves.
    Disabled,
}

/// Tuning knobs for stores and the transaction engine.
///
/// The defaults favor safety; [`StorageConfig::fast`] trades durability
/// for throughput and suits bulk loads and tests.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Chunks at or below this live-byte percentage are eligible for
    /// compaction rewrite. Zero disables rewriting entirely (fully
    /// garbage chunks are still deleted).
    pub min_fill_rate: u8,
    /// Cap on the live bytes a single compaction pass will rewrite.
    pub max_compact_size: u64,
    /// Serialized leaves larger than this are split before being written.
    pub page_split_size: usize,
    /// Redo log durability mode.
    pub sync_mode: SyncMode,
    /// Flush interval used when `sync_mode` is [`SyncMode::Periodic`].
    pub sync_interval: Duration,
    /// Interval for the background maintenance worker; `None` disables
    /// periodic compaction (explicit triggers still work).
    pub maintenance_interval: Option<Duration>,
    /// Removed-page count at which maintenance considers a store worth
    /// compacting.
    pub compact_threshold: usize,
    /// Origin tag baked into transaction names, `host:port` style.
    /// Embedded engines keep the default.
    pub host_and_port: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            min_fill_rate: 40,
            max_compact_size: 4 * 1024 * 1024,
            page_split_size: 16 * 1024,
            sync_mode: SyncMode::Instant,
            sync_interval: Duration::from_millis(100),
            maintenance_interval: Some(Duration::from_secs(60)),
            compact_threshold: 32,
            host_and_port: "0:0".to_string(),
        }
    }
}

impl StorageConfig {
    /// Maximum durability: instant fsync on every commit.
    pub fn durable() -> Self {
        Self::default()
    }

    /// Throughput over durability: periodic group fsync, eager
    /// compaction.
    pub fn fast() -> Self {
        Self {
            sync_mode: SyncMode::Periodic,
            sync_interval: Duration::from_millis(50),
            compact_threshold: 8,
            ..Self::default()
        }
    }

    /// No redo log, no background maintenance. Useful for scratch data
    /// and unit tests that manage saves themselves.
    pub fn ephemeral() -> Self {
        Self {
            sync_mode: SyncMode::Disabled,
            maintenance_interval: None,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_durable() {
        let cfg = StorageConfig::default();
        assert_eq!(cfg.sync_mode, SyncMode::Instant);
        assert_eq!(cfg.min_fill_rate, 40);
    }

    #[test]
    fn presets_differ_where_it_matters() {
        assert_eq!(StorageConfig::fast().sync_mode, SyncMode::Periodic);
        assert_eq!(StorageConfig::ephemeral().sync_mode, SyncMode::Disabled);
        assert!(StorageConfig::ephemeral().maintenance_interval.is_none());
    }
}
