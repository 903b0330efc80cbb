//! Protocol version and resource limit constants.

/// Current protocol version emitted by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version this implementation accepts. Version checks are
/// floor-only: there is no ceiling, so a newer sender can talk to an older
/// receiver as long as it stays above this floor.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u32 = 1;

/// Default ack-phase timeout in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1_000;

/// Default response-phase timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default async-phase timeout in milliseconds.
pub const DEFAULT_ASYNC_TIMEOUT_MS: u64 = 120_000;

/// Default stream idle timeout in milliseconds.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default stream overall expire timeout in milliseconds.
pub const DEFAULT_STREAM_EXPIRE_TIMEOUT_MS: u64 = 300_000;

/// Default high-water mark for a stream reader's internal buffer.
pub const DEFAULT_READER_HIGH_WATER_MARK: usize = 16;

/// Reader buffer index past which the consume-mode buffer is compacted.
pub const READER_COMPACT_THRESHOLD: usize = 128;
