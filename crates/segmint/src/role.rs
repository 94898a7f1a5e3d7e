use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Interval-parity class of a node.
///
/// The integer line of every (business type, time key) pair is divided into
/// contiguous intervals of `step_size` width. The `Odd` role owns intervals
/// with an even index (`[1, S]`, `[2S+1, 3S]`, ...), the `Even` role owns
/// intervals with an odd index (`[S+1, 2S]`, `[3S+1, 4S]`, ...). The two
/// interval sets are disjoint, which is what makes cross-node uniqueness hold
/// without any distributed locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Even,
    Odd,
}

impl Role {
    /// Wire/storage code: 0 = Even, 1 = Odd.
    pub const fn code(self) -> i16 {
        match self {
            Role::Even => 0,
            Role::Odd => 1,
        }
    }

    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Role::Even),
            1 => Some(Role::Odd),
            _ => None,
        }
    }

    /// The opposite role.
    pub const fn peer(self) -> Self {
        match self {
            Role::Even => Role::Odd,
            Role::Odd => Role::Even,
        }
    }

    /// Whether this role owns the interval with index `k`.
    pub const fn owns_interval(self, k: i64) -> bool {
        match self {
            Role::Odd => k % 2 == 0,
            Role::Even => k % 2 == 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Even => "even",
            Role::Odd => "odd",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "even" | "0" => Ok(Role::Even),
            "odd" | "1" => Ok(Role::Odd),
            other => Err(format!("unknown role '{other}', expected 'even' or 'odd'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for role in [Role::Even, Role::Odd] {
            assert_eq!(Role::from_code(role.code()), Some(role));
        }
        assert_eq!(Role::from_code(7), None);
    }

    #[test]
    fn peer_is_involution() {
        assert_eq!(Role::Even.peer(), Role::Odd);
        assert_eq!(Role::Odd.peer(), Role::Even);
    }

    #[test]
    fn interval_ownership_is_disjoint_and_total() {
        for k in 0..64 {
            assert_ne!(Role::Even.owns_interval(k), Role::Odd.owns_interval(k));
        }
        assert!(Role::Odd.owns_interval(0));
        assert!(Role::Even.owns_interval(1));
    }

    #[test]
    fn parses_names_and_codes() {
        assert_eq!("even".parse::<Role>().unwrap(), Role::Even);
        assert_eq!("ODD".parse::<Role>().unwrap(), Role::Odd);
        assert_eq!("1".parse::<Role>().unwrap(), Role::Odd);
        assert!("both".parse::<Role>().is_err());
    }
}
