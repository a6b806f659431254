//! # Configuration
//!
//! Tunables for reservation tables and the deferred-work thread.

// =============================================================================
// RESERVATION TABLE
// =============================================================================

/// Reservation table growth policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResvConfig {
    /// Minimum number of slots of the first table
    pub min_slots: usize,
    /// Capacity multiplier when the table must grow
    pub growth_factor: usize,
}

impl ResvConfig {
    /// Default minimum slot count
    pub const DEFAULT_MIN_SLOTS: usize = 4;
    /// Default growth multiplier
    pub const DEFAULT_GROWTH_FACTOR: usize = 2;

    /// Create the default configuration
    pub const fn new() -> Self {
        Self {
            min_slots: Self::DEFAULT_MIN_SLOTS,
            growth_factor: Self::DEFAULT_GROWTH_FACTOR,
        }
    }

    /// Set the minimum slot count (clamped to 1)
    pub const fn with_min_slots(mut self, min_slots: usize) -> Self {
        self.min_slots = if min_slots == 0 { 1 } else { min_slots };
        self
    }

    /// Set the growth multiplier (clamped to 2)
    pub const fn with_growth_factor(mut self, factor: usize) -> Self {
        self.growth_factor = if factor < 2 { 2 } else { factor };
        self
    }

    /// Capacity of the table replacing one with `max` slots and `used` entries,
    /// given that `wanted` more are requested
    ///
    /// `None` if the capacity does not fit in a `usize`.
    pub fn grown_capacity(&self, used: usize, max: usize, wanted: usize) -> Option<usize> {
        if max == 0 {
            return wanted
                .max(1)
                .checked_next_power_of_two()
                .map(|slots| slots.max(self.min_slots));
        }
        let needed = used.checked_add(wanted)?;
        Some(needed.max(max.checked_mul(self.growth_factor)?))
    }
}

impl Default for ResvConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DEFERRED WORK
// =============================================================================

/// Deferred-work thread configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkConfig {
    /// Worker thread name
    pub thread_name: &'static str,
}

impl WorkConfig {
    /// Default worker thread name
    pub const DEFAULT_THREAD_NAME: &'static str = "dmabuf-irq-work";

    /// Create the default configuration
    pub const fn new() -> Self {
        Self {
            thread_name: Self::DEFAULT_THREAD_NAME,
        }
    }

    /// Set the worker thread name
    pub const fn with_thread_name(mut self, name: &'static str) -> Self {
        self.thread_name = name;
        self
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_allocation_floor() {
        let config = ResvConfig::default();
        assert_eq!(config.grown_capacity(0, 0, 1), Some(4));
        assert_eq!(config.grown_capacity(0, 0, 5), Some(8));
        assert_eq!(config.grown_capacity(0, 0, 16), Some(16));
    }

    #[test]
    fn test_geometric_growth() {
        let config = ResvConfig::default();
        assert_eq!(config.grown_capacity(4, 4, 1), Some(8));
        assert_eq!(config.grown_capacity(4, 4, 20), Some(24));
    }

    #[test]
    fn test_capacity_overflow() {
        let config = ResvConfig::default();
        assert_eq!(config.grown_capacity(0, 0, usize::MAX), None);
        assert_eq!(config.grown_capacity(1, 4, usize::MAX), None);
        assert_eq!(config.grown_capacity(0, usize::MAX, 1), None);
    }

    #[test]
    fn test_builder_clamps() {
        let config = ResvConfig::new().with_min_slots(0).with_growth_factor(1);
        assert_eq!(config.min_slots, 1);
        assert_eq!(config.growth_factor, 2);
        assert_eq!(WorkConfig::new().with_thread_name("w").thread_name, "w");
    }
}
