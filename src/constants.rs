//! Protocol constants and tuning parameters.
//!
//! This module contains the defaults used throughout the node: wire protocol
//! values, transport pacing, lookup fan-out and the thresholds used by the
//! NAT and health monitors.

use std::time::Duration;

// ============================================================================
// Wire protocol
// ============================================================================

/// The only message version this node speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of node ids, targets and tokens.
pub const ID_LEN: usize = 32;

/// Encoded length of an IPv4 peer address (4 byte host + 2 byte port).
pub const PEER_ADDR_LEN: usize = 6;

/// Largest datagram we will try to read.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// ============================================================================
// Default port
// ============================================================================

/// Default UDP port. Zero lets the OS pick one.
pub const DEFAULT_PORT: u16 = 0;

// ============================================================================
// RPC transport
// ============================================================================

/// Maximum number of unacknowledged sends per drain tick.
/// Across the four window slots at most twice this many may be outstanding.
pub const DEFAULT_MAX_WINDOW: usize = 80;

/// Number of retransmissions before a request fails with a timeout.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Drain ticks a sent request waits for a reply before it is retried.
pub const DEFAULT_TIMEOUT_TICKS: u32 = 2;

/// How often the congestion window rotates and retries are evaluated.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(750);

/// Number of slots in the rotating congestion window.
pub const CONGESTION_SLOTS: usize = 4;

// ============================================================================
// Lookups
// ============================================================================

/// Bucket size, and the size of a query's closest-reply set.
pub const DEFAULT_K: usize = 20;

/// Nominal number of in-flight requests per query.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Fan-out used while a query seeded from cached nodes waits for its first reply.
pub const SLOWDOWN_CONCURRENCY: usize = 3;

/// Retrying requests that no longer count against a query's concurrency.
pub const DEFAULT_MAX_SLOW: usize = 5;

/// Number of routing table buckets (one per id bit).
pub const NUM_BUCKETS: usize = ID_LEN * 8;

// ============================================================================
// Maintenance
// ============================================================================

/// Interval of the background maintenance tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Background refresh lookups run every this many maintenance ticks.
pub const DEFAULT_REFRESH_TICKS: u64 = 60;

/// How often round-trip token secrets are rotated.
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Down hints sent or processed per maintenance tick.
pub const MAX_DOWN_HINTS_PER_TICK: usize = 50;

// ============================================================================
// NAT analysis
// ============================================================================

/// Capacity of the NAT sample ring.
pub const NAT_SAMPLE_CAPACITY: usize = 32;

/// Samples required before the NAT type is classified.
pub const DEFAULT_NAT_MIN_SAMPLES: usize = 3;

/// Median port deviation below which allocation is considered sequential.
pub const NAT_INCREMENTING_THRESHOLD: u32 = 200;

/// Outliers trimmed from each tail before taking the median port.
pub const NAT_MAX_OUTLIERS: usize = 3;

// ============================================================================
// Health
// ============================================================================

/// Number of counter snapshots kept by the health monitor.
pub const HEALTH_WINDOW: usize = 4;

/// Timeout rate above which an online node is considered degraded.
pub const DEGRADED_TIMEOUT_RATE: f64 = 0.5;
