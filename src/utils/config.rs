//! Helpers for bounded configuration values.

use std::cmp;
use std::time::Duration;

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy, Debug)]
pub struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    pub fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

impl DefMinMax<Duration> {
    /// Trims an optional duration where zero means "not set".
    ///
    /// `None` and a zero duration both result in `None`. Anything else is
    /// trimmed into the minimum/maximum range.
    pub fn limit_opt(self, value: Option<Duration>) -> Option<Duration> {
        match value {
            None => None,
            Some(value) if value.is_zero() => None,
            Some(value) => Some(self.limit(value)),
        }
    }
}

//============ Tests =========================================================
