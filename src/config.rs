//! Runtime settings shared by the services and store adapters.

/// Tunables for settlement passes and store write retries.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Only rank entries refreshed within this many days are eligible for a bonus.
    pub bonus_lookback_days: u32,
    /// Attempts an optimistic store transaction gets before giving up with a write conflict.
    pub max_write_attempts: u32,
    /// Bonus recipients when the caller does not say.
    pub default_top_n: usize,
    /// Flat bonus when the caller does not say.
    pub default_bonus_amount: f64,
}

pub const DEFAULT_BONUS_LOOKBACK_DAYS: u32 = 90;
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 8;
pub const DEFAULT_TOP_N: usize = 3;
pub const DEFAULT_BONUS_AMOUNT: f64 = 1000.0;

impl Default for Settings {
    fn default() -> Self {
        Self {
            bonus_lookback_days: DEFAULT_BONUS_LOOKBACK_DAYS,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            default_top_n: DEFAULT_TOP_N,
            default_bonus_amount: DEFAULT_BONUS_AMOUNT,
        }
    }
}
