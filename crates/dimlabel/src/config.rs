//! Configuration for storage and worker pools.

/// Default worker thread name prefix.
pub const DEFAULT_THREAD_NAME: &str = "dimlabel-worker";

/// Sync mode for fragment and schema file durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each file write (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration shared by every array opened through a storage context.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Sync mode used when writing schema and fragment files.
    pub sync_mode: SyncMode,
    /// Whether readers verify the CRC32 of every file they load.
    ///
    /// Default: true.
    pub verify_checksums: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            verify_checksums: true,
        }
    }
}

impl StorageConfig {
    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Enables or disables checksum verification on read.
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }
}

/// Configuration for a [`crate::pool::WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    ///
    /// Default: available parallelism, or 1 if it cannot be determined.
    pub threads: usize,
    /// Prefix for worker thread names; the worker number is appended.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl PoolConfig {
    /// Sets the number of worker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the worker thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}
