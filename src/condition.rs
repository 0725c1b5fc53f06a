//! Conditions that gate whether a `put`/`delete` is applied.

/// A precondition on the slot's current value that must hold for a `put` to
/// take effect.
///
/// The internal `Copying` condition used by migration is not exposed here;
/// see `crate::table::PutCondition`.
#[derive(Debug)]
pub enum Condition<V> {
  /// Always applies, overwriting whatever was there.
  Always,
  /// Applies only if the key currently has no live value.
  IfAbsent,
  /// Applies only if the key currently has a live value.
  IfExists,
  /// Applies only if the key's current live value equals the given one.
  IfMatches(V),
}
