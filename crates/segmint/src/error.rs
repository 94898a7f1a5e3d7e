use crate::role::Role;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the issuance core.
///
/// Store failures keep their source so the boundary can log the full chain.
/// Background loops never bubble these up; they log and keep ticking. Request
/// paths propagate them to the caller unchanged.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request was malformed; no state was touched.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    /// The backing segment store failed.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// A concurrent writer got there first: the update matched no rows.
    #[error("segment update for {business_type}:{time_key} role {role} affected no rows")]
    SegmentRace {
        business_type: String,
        time_key: String,
        role: Role,
    },

    /// A refill could not produce a usable interval.
    #[error("segment refill failed for {business_type}:{time_key}: {reason}")]
    RefillFailed {
        business_type: String,
        time_key: String,
        reason: String,
    },

    /// The stored `max_value` does not sit on an interval boundary owned by
    /// its role. Issuance from this record is refused until an operator runs
    /// conflict resolution.
    #[error(
        "corrupt segment {business_type}:{time_key}: max_value {max_value} \
         (step {step_size}) is not on a {role}-owned interval boundary"
    )]
    CorruptSegment {
        business_type: String,
        time_key: String,
        role: Role,
        max_value: i64,
        step_size: i32,
    },
}

impl Error {
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation {
            reason: reason.into(),
        }
    }

    pub fn store(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Store(Box::new(source))
    }

    /// Whether the caller is at fault (maps to HTTP 400 at the boundary).
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}
