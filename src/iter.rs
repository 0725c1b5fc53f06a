//! Snapshot-style iteration over a [`crate::Map`]'s live entries.

use core::hash::BuildHasher;
use core::hash::Hash;

use crate::map::Map;
use crate::payload::Payload;
use crate::table::Generation;

/// Iterator returned by [`Map::iter`]. See that method for the exact
/// snapshot contract.
pub struct Iter<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  map: &'a Map<K, V, S>,
  current: *const Generation<K, V>,
  index: usize,
  /// Whether the calling thread's guard is currently pinned to
  /// `current.number`. Held across `next()` calls for as long as `current`
  /// doesn't change, so a generation can't be retired and freed out from
  /// under a scan that is only paused between slots.
  pinned: bool,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  pub(crate) fn new(map: &'a Map<K, V, S>) -> Self {
    Self {
      map,
      current: map.head_ptr(),
      index: 0,
      pinned: false,
    }
  }
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq + Clone,
  V: Payload + PartialEq + Clone,
  S: BuildHasher,
{
  type Item = (K, V);

  fn next(&mut self) -> Option<(K, V)> {
    self.map.with_guard(|guard| {
      loop {
        if self.current.is_null() {
          return None;
        }

        // SAFETY: a generation is only freed once no guard can still observe
        // its `number`; `guard.pin` below publishes that we are about to,
        // and stays published (see `pinned`) for the rest of this
        // generation's scan, not just this one call.
        let generation = unsafe { &*self.current };
        if !self.pinned {
          guard.pin(generation.number);
          self.pinned = true;
        }

        while self.index < generation.size() {
          let idx = self.index;
          self.index += 1;

          if let Some((key_word, value_word)) = generation.iter_slot(idx) {
            // SAFETY: `iter_slot` only hands back words for slots that are
            // currently installed and not mid-migration; `peek` borrows
            // without disturbing them.
            let key = unsafe { (*K::peek(key_word)).clone() };
            let value = unsafe { (*V::peek(value_word)).clone() };
            return Some((key, value));
          }
        }

        guard.unpin();
        self.pinned = false;
        self.current = generation.next_ptr();
        self.index = 0;
      }
    })
  }
}

impl<'a, K, V, S> Drop for Iter<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  fn drop(&mut self) {
    if self.pinned {
      self.map.with_guard(|guard| guard.unpin());
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use crate::map::Map;

  #[test]
  fn iter_over_empty_map_yields_nothing() {
    let map: Map<u64, u64> = Map::new();
    assert_eq!(map.iter().count(), 0);
  }

  #[test]
  fn iter_visits_every_inserted_key_exactly_once() {
    let map: Map<u64, u64> = Map::new();
    for key in 0..50u64 {
      map.put(key, key * 2);
    }

    let seen: HashSet<u64> = map.iter().map(|(key, _)| key).collect();
    assert_eq!(seen.len(), 50);
    for (key, value) in map.iter() {
      assert_eq!(value, key * 2);
    }
  }

  #[test]
  fn iter_skips_deleted_keys() {
    let map: Map<u64, u64> = Map::new();
    map.put(1, 10);
    map.put(2, 20);
    map.delete(1);

    let pairs: Vec<_> = map.iter().collect();
    assert_eq!(pairs, vec![(2, 20)]);
  }

  #[test]
  fn iter_survives_migration() {
    let map: Map<u64, u64> = crate::config::Config::new().initial_size(1).density(0.5).build();
    for key in 0..40u64 {
      map.put(key, key);
    }

    let seen: HashSet<u64> = map.iter().map(|(key, _)| key).collect();
    assert_eq!(seen.len(), 40);
  }
}
