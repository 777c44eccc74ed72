use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all on-disk state.
    pub data_dir: PathBuf,

    /// Slab size backing one mem series generation (default: 1 MiB).
    pub mem_series_size: usize,

    /// Target uncompressed size of a data block (default: 64 KiB).
    pub block_size: usize,

    /// Number of blocks after which a mem series is considered full
    /// (default: 16).
    pub max_blocks_per_mem_series: usize,

    /// Size at which a commit log segment rotates (default: 32 MiB).
    pub segment_size: u64,

    /// Number of buffered bytes that triggers a group commit before the
    /// batch window elapses (default: 512 KiB).
    pub batch_size: usize,

    /// Longest time a pending commit log append waits for co-batched
    /// writers before the batch is forced out (default: 10 ms).
    pub batch_window: Duration,

    /// Number of retained segments above which the oldest referenced
    /// segment has its partitions force flushed (default: 8).
    pub max_segments: usize,

    /// Discard the commit log tail after a corrupt frame instead of
    /// failing startup (default: false).
    pub truncate_corrupt_tail: bool,

    /// Total mem series memory that triggers flushing the largest
    /// partition (default: 64 MiB).
    pub memory_soft_limit: usize,

    /// Total mem series memory above which writers block until flushes
    /// bring usage back under the soft limit (default: 128 MiB).
    pub memory_hard_limit: usize,

    /// Number of concurrent flush workers (default: 2).
    pub flush_workers: usize,

    /// Number of live partitions kept in the manager cache (default: 64).
    pub partition_cache_size: usize,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to reconsider segment retention (default: 5s)
    pub segment_cleanup_interval: Duration,

    /// How often to check memory usage against the caps (default: 250ms)
    pub memory_check_interval: Duration,

    /// How often to evict idle fully flushed partitions (default: 30s)
    pub eviction_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./horizondb"),
            mem_series_size: 1024 * 1024,
            block_size: 64 * 1024,
            max_blocks_per_mem_series: 16,
            segment_size: 32 * 1024 * 1024,
            batch_size: 512 * 1024,
            batch_window: Duration::from_millis(10),
            max_segments: 8,
            truncate_corrupt_tail: false,
            memory_soft_limit: 64 * 1024 * 1024,
            memory_hard_limit: 128 * 1024 * 1024,
            flush_workers: 2,
            partition_cache_size: 64,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            segment_cleanup_interval: Duration::from_secs(5),
            memory_check_interval: Duration::from_millis(250),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the mem series slab size
    pub fn mem_series_size(mut self, size: usize) -> Self {
        self.mem_series_size = size;
        self
    }

    /// Set the target uncompressed block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the mem series block count limit
    pub fn max_blocks_per_mem_series(mut self, count: usize) -> Self {
        self.max_blocks_per_mem_series = count;
        self
    }

    /// Set the commit log segment rotation size
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the group commit byte threshold
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the group commit time window
    pub fn batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Set the retained segment count threshold
    pub fn max_segments(mut self, count: usize) -> Self {
        self.max_segments = count;
        self
    }

    /// Discard a corrupt commit log tail on replay instead of failing
    pub fn truncate_corrupt_tail(mut self, enabled: bool) -> Self {
        self.truncate_corrupt_tail = enabled;
        self
    }

    /// Set the memory soft limit
    pub fn memory_soft_limit(mut self, limit: usize) -> Self {
        self.memory_soft_limit = limit;
        self
    }

    /// Set the memory hard limit
    pub fn memory_hard_limit(mut self, limit: usize) -> Self {
        self.memory_hard_limit = limit;
        self
    }

    /// Set the flush worker count
    pub fn flush_workers(mut self, count: usize) -> Self {
        self.flush_workers = count;
        self
    }

    /// Set the partition cache capacity
    pub fn partition_cache_size(mut self, size: usize) -> Self {
        self.partition_cache_size = size;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Path of the commit log directory.
    pub fn commitlog_dir(&self) -> PathBuf {
        self.data_dir.join("commitlog")
    }

    /// Path of the data directory for the given database.
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.data_dir.join(database)
    }
}

impl SchedulerConfig {
    /// Set the segment cleanup interval
    pub fn segment_cleanup_interval(mut self, interval: Duration) -> Self {
        self.segment_cleanup_interval = interval;
        self
    }

    /// Set the memory check interval
    pub fn memory_check_interval(mut self, interval: Duration) -> Self {
        self.memory_check_interval = interval;
        self
    }

    /// Set the partition eviction interval
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }
}
