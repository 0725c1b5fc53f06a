//! Runtime configuration for a [`crate::Map`].
//!
//! Where the upstream capacity scheme fixed table size at compile time
//! through a `Params` trait, this table resizes itself at runtime, so the
//! equivalent knobs — initial size and target load factor — are validated
//! and clamped the same way: a newtype that normalizes its input once, at
//! construction, and is cheap to `Debug`-print afterward.

use core::fmt;

/// Smallest initial table size, in slots. A single-slot table is a valid
/// (if migration-happy) configuration.
pub const MIN_INITIAL_SIZE: usize = 1;

/// Largest initial table size, in slots. Chosen so `size * size_of::<Slot>()`
/// cannot overflow `isize` on a 32-bit target.
pub const MAX_INITIAL_SIZE: usize = 1 << 26;

/// Default initial table size, in slots.
pub const DEFAULT_INITIAL_SIZE: usize = 16;

/// Default target load factor.
pub const DEFAULT_DENSITY: f64 = 0.5;

/// A validated target load factor in `(0.0, 1.0]`.
///
/// A table never lets its approximate live-key count exceed
/// `size * min(0.7, 2 * density)` before triggering a migration (see
/// [`crate::table`]), and a successor table is sized so the migrated
/// entries occupy about `density` of its slots.
#[derive(Clone, Copy, PartialEq)]
pub struct Density(f64);

impl Density {
  /// Clamps `value` into `(0.0, 1.0]`, rounding non-finite input down to the
  /// default.
  #[must_use]
  pub fn new(value: f64) -> Self {
    if value.is_finite() && value > 0.0 {
      Self(value.min(1.0))
    } else {
      Self(DEFAULT_DENSITY)
    }
  }

  #[inline]
  pub(crate) fn as_f64(self) -> f64 {
    self.0
  }
}

impl Default for Density {
  fn default() -> Self {
    Self(DEFAULT_DENSITY)
  }
}

impl fmt::Debug for Density {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Density").field("target_load_factor", &self.0).finish()
  }
}

/// Builder for the runtime knobs of a [`crate::Map`].
///
/// ```
/// use scalemap::Config;
///
/// let config = Config::new().initial_size(1024).density(0.6);
/// let map = config.build::<u64, u64>();
/// assert_eq!(map.size(), 0);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Config {
  initial_size: usize,
  density: Density,
}

impl Config {
  /// Starts a new configuration at the crate defaults.
  #[must_use]
  pub fn new() -> Self {
    Self {
      initial_size: DEFAULT_INITIAL_SIZE,
      density: Density::default(),
    }
  }

  /// Sets the initial table size, in slots. Rounded up to the next power of
  /// two and clamped to `[MIN_INITIAL_SIZE, MAX_INITIAL_SIZE]`.
  #[must_use]
  pub fn initial_size(mut self, size: usize) -> Self {
    let clamped = size.clamp(MIN_INITIAL_SIZE, MAX_INITIAL_SIZE);
    self.initial_size = clamped.next_power_of_two();
    self
  }

  /// Sets the target load factor. See [`Density`].
  #[must_use]
  pub fn density(mut self, density: f64) -> Self {
    self.density = Density::new(density);
    self
  }

  pub(crate) const fn resolved_initial_size(&self) -> usize {
    self.initial_size
  }

  pub(crate) const fn resolved_density(&self) -> Density {
    self.density
  }

  /// Builds a [`crate::Map`] using `std`'s default hasher and this
  /// configuration.
  #[must_use]
  pub fn build<K, V>(self) -> crate::Map<K, V>
  where
    K: crate::payload::Payload + Eq + core::hash::Hash,
    V: crate::payload::Payload + PartialEq,
  {
    crate::Map::with_config(self)
  }

  /// Builds a [`crate::Map`] using a caller-supplied hasher builder.
  #[must_use]
  pub fn build_with_hasher<K, V, S>(self, hasher: S) -> crate::Map<K, V, S>
  where
    K: crate::payload::Payload + Eq + core::hash::Hash,
    V: crate::payload::Payload + PartialEq,
    S: core::hash::BuildHasher,
  {
    crate::Map::with_config_and_hasher(self, hasher)
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn initial_size_rounds_up_and_clamps() {
    assert_eq!(Config::new().initial_size(100).resolved_initial_size(), 128);
    assert_eq!(Config::new().initial_size(1).resolved_initial_size(), 1);
    assert_eq!(Config::new().initial_size(0).resolved_initial_size(), MIN_INITIAL_SIZE);
    assert_eq!(Config::new().initial_size(usize::MAX).resolved_initial_size(), MAX_INITIAL_SIZE);
  }

  #[test]
  fn density_clamps_into_unit_interval() {
    assert_eq!(Density::new(2.0).as_f64(), 1.0);
    assert_eq!(Density::new(f64::NAN).as_f64(), DEFAULT_DENSITY);
    assert_eq!(Density::new(0.3).as_f64(), 0.3);
  }

  #[test]
  fn default_config_matches_documented_defaults() {
    let config = Config::default();
    assert_eq!(config.resolved_initial_size(), DEFAULT_INITIAL_SIZE);
    assert_eq!(config.resolved_density().as_f64(), DEFAULT_DENSITY);
  }
}
