//! Centralized timing policies for the checkpoint loops.
//!
//! Every default lives here so the primary coordinator, the secondary processor
//! and the configuration layer agree on the same knobs.

use std::time::Duration;

/// Minimum spacing between two checkpoints. Back-to-back transactions would
/// keep the guest stopped continuously.
pub const CHECKPOINT_MIN_PERIOD: Duration = Duration::from_millis(100);
/// Forced checkpoint interval when the compare oracle stays quiet.
pub const CHECKPOINT_MAX_PERIOD: Duration = Duration::from_secs(10);
/// Sleep between trigger evaluations when there is nothing to do.
pub const IDLE_POLL: Duration = Duration::from_millis(100);
/// How long the secondary waits for a failover request after losing the
/// checkpoint channel before deciding to terminate.
pub const SECONDARY_FAILOVER_GRACE: Duration = Duration::from_secs(2);

/// Pending dirty memory above which the primary pushes pages between checkpoints.
pub const LIVE_MIGRATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;
/// Initial capacity of the checkpoint buffer.
pub const CHECKPOINT_BUFFER_BASE_SIZE: usize = 4 * 1024 * 1024;
/// Largest device-state payload the secondary accepts.
pub const MAX_DEVICE_STATE_BYTES: u64 = 1024 * 1024 * 1024;
