//! Controller timing and retry constants.

/// Window in which successive pod events for one Service are coalesced.
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Interval between full resynchronization passes of the endpoint controller.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// How often a replica-set loop re-probes pods while waiting on a transition.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 250;

/// How long a pod must stay ready before its ordinal counts as Ready.
pub const DEFAULT_MIN_READY_MS: u64 = 0;

/// First retry delay after a failed ordinal creation step.
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 500;

/// Upper bound on the retry delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Multiplier applied to the retry delay after each failure.
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// Number of pod events retained for replay by the event log.
pub const POD_EVENT_LOG_CAPACITY: usize = 1024;

/// Capacity of the ordinal transition broadcast channel.
pub const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Label carrying the stable pod name on pods of an ordinal replica set.
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Address prefix of pod IPs handed out by the in-process cluster.
pub const LOCAL_POD_SUBNET: &str = "10.244.0";
