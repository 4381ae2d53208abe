// ============================================================================
// Protocol constants
// ============================================================================

/// Protocol tag advertised in the agent card extension block.
pub const PROTOCOL_TAG: &str = "KTP/1.0";

// --- Topics -----------------------------------------------------------------

/// Topic every node joins at startup. Leaving it is refused.
pub const DEFAULT_TOPIC: &str = "kizuna-swarm";

// --- Session timing ---------------------------------------------------------

/// Interval between bare `{"type":"ping"}` heartbeat frames.
pub const HEARTBEAT_INTERVAL_MS: u64 = 2_500;

/// A peer silent for longer than this is evicted by the timeout reaper.
/// At one ping per 2.5 s this allows ~3 missed heartbeats.
pub const PEER_TIMEOUT_MS: u64 = 10_000;

/// Timeout reaper tick.
pub const TIMEOUT_REAP_INTERVAL_MS: u64 = 5_000;

/// Entropy reaper tick (fault injection; disabled unless toggled on).
pub const ENTROPY_REAP_INTERVAL_MS: u64 = 30_000;

/// Per-peer drop probability on each entropy tick.
pub const ENTROPY_DROP_PROBABILITY: f64 = 0.5;

// --- Task retry -------------------------------------------------------------

/// Retry reaper tick.
pub const RETRY_REAP_INTERVAL_MS: u64 = 5_000;

/// Exponential backoff base: delay = min(base * 2^attempts, cap).
pub const RETRY_BASE_MS: u64 = 5_000;

/// Backoff ceiling.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// A queued task is dead-lettered after this many delivery attempts.
pub const MAX_ATTEMPTS: u32 = 3;

// --- Transport --------------------------------------------------------------

/// Maximum bytes in a single wire frame (length prefix excluded).
/// Generous headroom over the 50 KB task-context cap.
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Inbox capacity; the oldest record is dropped when full.
pub const INBOX_CAPACITY: usize = 1_000;
