//! State store key layout.

/// Prefix under which published endpoint sets are stored.
/// Full key = `ENDPOINTS_PREFIX + "<namespace>/<service>"`.
pub const ENDPOINTS_PREFIX: &str = "/registry/endpoints/";

/// Prefix under which replica-set ordinal status snapshots are stored.
/// Full key = `ORDINALS_PREFIX + "<namespace>/<statefulset>"`.
pub const ORDINALS_PREFIX: &str = "/registry/ordinals/";
