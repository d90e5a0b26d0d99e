//! Runtime configuration shared by DCP bootstrap code.

use crate::ids::VBucketCount;

/// Bootstrap configuration consumed by the DCP connection registry and its streams.
#[derive(Debug, Clone, PartialEq)]
pub struct DcpConfig {
    /// Number of vbuckets the bucket partitions its keyspace into.
    pub vbucket_count: VBucketCount,
    /// Minimum compression ratio below which producer payloads are sent uncompressed.
    pub min_compression_ratio: f32,
    /// Checkpoint processor streams handled per run before the task yields.
    pub producer_snapshot_marker_yield_limit: usize,
    /// Bucket memory quota in bytes; drives the concurrent-backfill cap.
    pub max_data_size: u64,
    /// Messages one consumer drains from a passive-stream buffer per processor cycle.
    pub consumer_process_batch_size: usize,
    /// Passive-stream receive buffer capacity in bytes.
    pub consumer_buffer_bytes: u64,
    /// Consecutive apply failures tolerated before a passive stream is ended as slow.
    pub consumer_cannot_process_budget: usize,
    /// Ready-queue bytes beyond which one producer stream is a slow-eviction candidate.
    pub slow_stream_byte_threshold: u64,
    /// Seconds one producer stream must sit unpulled before slow eviction applies.
    pub slow_stream_idle_secs: u64,
}

impl Default for DcpConfig {
    fn default() -> Self {
        Self {
            vbucket_count: VBucketCount::new(1024).expect("literal vbucket count must be non-zero"),
            min_compression_ratio: 0.85,
            producer_snapshot_marker_yield_limit: 10,
            max_data_size: 1024 * 1024 * 1024,
            consumer_process_batch_size: 10,
            consumer_buffer_bytes: 10 * 1024 * 1024,
            consumer_cannot_process_budget: 10,
            slow_stream_byte_threshold: 10 * 1024 * 1024,
            slow_stream_idle_secs: 300,
        }
    }
}
