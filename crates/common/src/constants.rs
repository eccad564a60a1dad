use std::time::Duration;

/// Default time an auction waits for header bidders, in milliseconds.
pub const DEFAULT_BIDDER_TIMEOUT_MS: u64 = 1500;

/// Default batching window before a round fires, in milliseconds.
pub const DEFAULT_THROTTLE_TIMEOUT_MS: u64 = 50;

/// Grace period added on top of the bidder timeout before a round is forced
/// to render.
pub const ROUND_TIMEOUT_BUFFER: Duration = Duration::from_millis(100);

/// Upper bound accepted for the bidder timeout setting.
pub const MAX_BIDDER_TIMEOUT_MS: u64 = 60_000;

/// Upper bound accepted for the throttle timeout setting.
pub const MAX_THROTTLE_TIMEOUT_MS: u64 = 10_000;

/// Prefix used for environment overrides of [`crate::settings::Settings`].
pub const ENV_PREFIX: &str = "BIDFLOW";

/// Prefix written in front of every event forwarded by the debug sink.
pub const DEBUG_PREFIX: &str = "BIDFLOW";
