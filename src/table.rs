//! A single table generation: lock-free linear-probed storage plus its share
//! of the incremental migration protocol.
//!
//! A [`Generation`] never resizes itself. When it approaches capacity it
//! allocates exactly one successor ([`Generation::ensure_next`]) and every
//! thread that subsequently touches it helps copy a slice of its slots into
//! that successor ([`Generation::do_copy_task`]) until none remain, at which
//! point it retires from [`crate::map::Inner::head`] and is handed to the
//! reclaimer.

use core::marker::PhantomData;

use crate::array::Array;
use crate::guard::GuardRecord;
use crate::map::Inner;
use crate::payload::Payload;
use crate::sentinel::Sentinel;
use crate::sync::Mutex;
use crate::sync::atomic::AtomicBool;
use crate::sync::atomic::AtomicIsize;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::AtomicUsize;
use crate::sync::atomic::Ordering::AcqRel;
use crate::sync::atomic::Ordering::Acquire;
use crate::sync::atomic::Ordering::Relaxed;
use crate::sync::atomic::Ordering::Release;

/// One key/value cell. Both halves are raw sentinel-encoded machine words;
/// [`Generation`] never holds a typed `K`/`V` directly.
pub(crate) struct Slot {
  key: AtomicUsize,
  value: AtomicUsize,
}

/// A precondition on a slot's current pure value, checked immediately before
/// the value CAS in [`Generation::put_value`].
///
/// `Copying` is never constructed outside [`Generation::copy`]; it is how
/// migration re-inserts a slot's value into a successor without letting an
/// ordinary racing put mistake a half-migrated slot for a fresh one.
pub(crate) enum PutCondition<'a, V> {
  Always,
  IfAbsent,
  IfExists,
  IfMatches(&'a V),
  Copying,
}

impl<'a, V> Clone for PutCondition<'a, V> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<'a, V> Copy for PutCondition<'a, V> {}

impl<'a, V> PutCondition<'a, V>
where
  V: Payload + PartialEq,
{
  fn requires_existing_key(&self) -> bool {
    matches!(self, PutCondition::IfExists | PutCondition::IfMatches(_))
  }

  /// `prior` must already be pure (COPYING stripped).
  fn accepts(&self, prior: usize) -> bool {
    let absent = is_absent::<V>(prior);
    match self {
      PutCondition::Always => true,
      PutCondition::IfAbsent => absent,
      PutCondition::IfExists => !absent,
      PutCondition::IfMatches(expected) => {
        if absent {
          return false;
        }
        let current = unsafe { V::peek(prior) };
        &*current == *expected
      }
      PutCondition::Copying => prior == V::Sentinel::BABY,
    }
  }
}

#[inline]
fn is_absent<V: Payload>(pure: usize) -> bool {
  pure == V::Sentinel::NONE || pure == V::Sentinel::BABY
}

/// Outcome of resolving a slot for a given key during [`Generation::lookup`].
enum LookupResult {
  /// `key` is already installed at this index.
  Found(usize),
  /// This index's key cell is `NONE`; a fresh key may be CAS-installed here.
  Reservation(usize),
  /// All `size` slots were examined without finding a match or a free cell.
  Exhausted,
}

/// Outcome of [`Generation::get_word`].
pub(crate) enum GetWordOutcome {
  Found(usize),
  NotFound,
  /// The answer isn't in this generation; the caller should try `next`.
  Consult,
}

/// Outcome of [`Generation::put_word`].
///
/// `Full` always hands back ownership of both words: a caller that receives
/// it must retry the identical operation against the next generation
/// (creating one first if necessary). The returned `key_word` is not
/// necessarily the word the caller passed in — if installing the key into
/// this generation succeeded but the value CAS then lost to a concurrent
/// migration, the word returned is the one now sitting (forever) in this
/// generation's slot, which is safe to reinstall in the successor because a
/// generation's `Drop` skips any slot whose value is `COPIED`.
pub(crate) enum PutWordOutcome {
  Applied {
    #[allow(dead_code)]
    was_insert: bool,
  },
  Rejected,
  Full { key_word: usize, value_word: usize },
}

/// Atomically decreases `cell` to `min(cell, value)`. `AtomicUsize::fetch_min`
/// is not available under every backend this crate targets, so the running
/// minimum is maintained with a compare-exchange loop instead.
fn fetch_min(cell: &AtomicUsize, value: usize) {
  let mut current = cell.load(Relaxed);
  while value < current {
    match cell.compare_exchange_weak(current, value, Relaxed, Relaxed) {
      Ok(_) => break,
      Err(actual) => current = actual,
    }
  }
}

/// One version of the table: a fixed-size, power-of-two slot array plus the
/// bookkeeping needed to elect and feed a successor.
pub(crate) struct Generation<K, V>
where
  K: Payload,
  V: Payload,
{
  /// Monotonically increasing identifier, assigned when this generation is
  /// created; used as the guard watermark.
  pub(crate) number: usize,
  mask: usize,
  density: f64,
  slots: Array<Slot>,
  /// Running count of live (non-`NONE`/`BABY`) slots, maintained incrementally
  /// by every successful value CAS. Drives this generation's own fullness
  /// heuristic and its successor's sizing; approximate under concurrency the
  /// way the spec's "approximate live-key count" is approximate everywhere
  /// else, but authoritative enough for those two purposes.
  alive: AtomicIsize,
  is_full: AtomicBool,
  min_probe: AtomicUsize,
  copied: AtomicUsize,
  copy_task_size: AtomicUsize,
  next: AtomicPtr<Generation<K, V>>,
  next_lock: Mutex<()>,
  _marker: PhantomData<(K, V)>,
}

impl<K, V> Generation<K, V>
where
  K: Payload + PartialEq,
  V: Payload + PartialEq,
{
  pub(crate) fn new(size: usize, number: usize, density: f64) -> Self {
    debug_assert!(size.is_power_of_two(), "generation size must be a power of two");

    Self {
      number,
      mask: size - 1,
      density,
      slots: Array::new(size, |_| Slot {
        key: AtomicUsize::new(K::Sentinel::NONE),
        value: AtomicUsize::new(V::Sentinel::BABY),
      }),
      alive: AtomicIsize::new(0),
      is_full: AtomicBool::new(false),
      min_probe: AtomicUsize::new(size),
      copied: AtomicUsize::new(0),
      copy_task_size: AtomicUsize::new(1),
      next: AtomicPtr::new(core::ptr::null_mut()),
      next_lock: Mutex::new(()),
      _marker: PhantomData,
    }
  }

  #[inline]
  pub(crate) fn size(&self) -> usize {
    self.mask + 1
  }

  pub(crate) fn is_full(&self) -> bool {
    self.is_full.load(Relaxed)
  }

  pub(crate) fn has_next(&self) -> bool {
    !self.next.load(Acquire).is_null()
  }

  pub(crate) fn next_ptr(&self) -> *mut Generation<K, V> {
    self.next.load(Acquire)
  }

  /// Reads slot `idx` for snapshot iteration, returning the raw key/value
  /// words if it holds a live entry untouched by migration. Never triggers a
  /// copy: a `COPYING` slot is simply skipped, matching the "no stability
  /// guarantee under concurrent mutation" iterator contract.
  pub(crate) fn iter_slot(&self, idx: usize) -> Option<(usize, usize)> {
    // SAFETY: `idx` is caller-supplied and bounded by `self.size()`.
    let slot = unsafe { self.slots.get_unchecked(idx) };
    let value = slot.value.load(Acquire);

    if V::Sentinel::is_copying(value) {
      return None;
    }

    let pure = V::Sentinel::pure(value);
    if is_absent::<V>(pure) || pure == V::Sentinel::COPIED || pure == V::Sentinel::DELETED {
      return None;
    }

    let key = slot.key.load(Acquire);
    if key == K::Sentinel::NONE {
      return None;
    }

    Some((key, pure))
  }

  fn upper_key_count_bound(&self) -> usize {
    let size = self.size();
    let factor = (2.0 * self.density).min(0.7);
    ((factor * size as f64).ceil() as usize).min(size)
  }

  fn slot_key_matches(existing: usize, sought: usize) -> bool {
    if existing == sought {
      return true;
    }
    let a = unsafe { K::peek(existing) };
    let b = unsafe { K::peek(sought) };
    *a == *b
  }

  /// Probes for `hash`, calling `matches(existing_key_word)` on every
  /// occupied slot it visits. Shared by the borrowed-key path ([`Generation::get_word`])
  /// and the owned-word path ([`Generation::put_word`]), which compare
  /// differently but probe identically.
  fn lookup(&self, hash: u64, matches: impl Fn(usize) -> bool) -> LookupResult {
    let size = self.size();
    let start = (hash as usize) & self.mask;
    let bound = self.upper_key_count_bound();

    for step in 0..size {
      let idx = (start + step) & self.mask;
      // SAFETY: `idx` is masked into `0..size`.
      let slot = unsafe { self.slots.get_unchecked(idx) };
      let existing = slot.key.load(Acquire);

      if existing == K::Sentinel::NONE {
        self.note_probe(step + 1, bound);
        return LookupResult::Reservation(idx);
      }

      if matches(existing) {
        self.note_probe(step + 1, bound);
        return LookupResult::Found(idx);
      }
    }

    self.is_full.store(true, Relaxed);
    LookupResult::Exhausted
  }

  fn note_probe(&self, probes_taken: usize, bound: usize) {
    let size = self.size();
    let remaining = size - probes_taken;
    fetch_min(&self.min_probe, remaining);

    if self.min_probe.load(Relaxed) < size.saturating_sub(bound) && self.alive.load(Relaxed).max(0) as usize >= bound {
      self.is_full.store(true, Relaxed);
    }
  }

  pub(crate) fn get_word<S>(&self, key: &K, hash: u64, host: &Inner<K, V, S>, guard: &GuardRecord) -> GetWordOutcome
  where
    K: core::hash::Hash,
    S: core::hash::BuildHasher,
  {
    match self.lookup(hash, |existing| {
      let peeked = unsafe { K::peek(existing) };
      *peeked == *key
    }) {
      LookupResult::Found(idx) => self.get_entry(idx, host, guard),
      LookupResult::Reservation(_) => {
        if self.is_full() {
          GetWordOutcome::Consult
        } else {
          GetWordOutcome::NotFound
        }
      }
      LookupResult::Exhausted => GetWordOutcome::Consult,
    }
  }

  fn get_entry<S>(&self, idx: usize, host: &Inner<K, V, S>, guard: &GuardRecord) -> GetWordOutcome
  where
    K: core::hash::Hash,
    S: core::hash::BuildHasher,
  {
    // SAFETY: `idx` came from `self.lookup` and is in range.
    let slot = unsafe { self.slots.get_unchecked(idx) };
    let mut word = slot.value.load(Acquire);

    if V::Sentinel::is_copying(word) {
      self.copy(idx, host, guard);
      word = slot.value.load(Acquire);
    }

    let pure = V::Sentinel::pure(word);
    if pure == V::Sentinel::COPIED || pure == V::Sentinel::DELETED {
      GetWordOutcome::Consult
    } else if is_absent::<V>(pure) {
      GetWordOutcome::NotFound
    } else {
      GetWordOutcome::Found(pure)
    }
  }

  /// Installs `key_word`/`value_word` according to `condition`, retrying
  /// across slots within this generation only. A `Full` result means the
  /// caller must retry against `self.next` (after [`Generation::ensure_next`]
  /// if it doesn't exist yet).
  ///
  /// Both words are always consumed by this call: on `Applied` the value word
  /// is installed (and any live prior value is released through
  /// [`Payload::take`]); on `Rejected` both words are reclaimed internally;
  /// on `Full` both are returned for the caller to reinstall elsewhere.
  pub(crate) fn put_word<S>(
    &self,
    key_word: usize,
    value_word: usize,
    hash: u64,
    condition: PutCondition<'_, V>,
    host: &Inner<K, V, S>,
    guard: &GuardRecord,
  ) -> PutWordOutcome
  where
    K: core::hash::Hash,
    S: core::hash::BuildHasher,
  {
    loop {
      match self.lookup(hash, |existing| Self::slot_key_matches(existing, key_word)) {
        LookupResult::Exhausted => return PutWordOutcome::Full { key_word, value_word },

        LookupResult::Found(idx) => {
          // The slot already carries an equal key; our copy is redundant.
          unsafe { K::take(key_word) };
          return self.put_value(idx, value_word, &condition, host, guard);
        }

        LookupResult::Reservation(idx) => {
          if condition.requires_existing_key() {
            unsafe { K::take(key_word) };
            unsafe { V::take(value_word) };
            return PutWordOutcome::Rejected;
          }

          // SAFETY: `idx` came from `self.lookup` and is in range.
          let slot = unsafe { self.slots.get_unchecked(idx) };

          match slot.key.compare_exchange(K::Sentinel::NONE, key_word, AcqRel, Acquire) {
            Ok(_) => {
              guard.note_key_installed();
              return self.put_value(idx, value_word, &condition, host, guard);
            }
            Err(_) => {
              // Someone else claimed this slot first; `key_word` is untouched
              // because the CAS never took effect. Re-lookup from scratch.
              continue;
            }
          }
        }
      }
    }
  }

  fn put_value<S>(&self, idx: usize, value_word: usize, condition: &PutCondition<'_, V>, host: &Inner<K, V, S>, guard: &GuardRecord) -> PutWordOutcome
  where
    K: core::hash::Hash,
    S: core::hash::BuildHasher,
  {
    // SAFETY: `idx` was resolved by `self.lookup` and is in range.
    let slot = unsafe { self.slots.get_unchecked(idx) };

    loop {
      let prior = slot.value.load(Acquire);

      if V::Sentinel::is_copying(prior) {
        self.copy(idx, host, guard);
        let key_word = slot.key.load(Relaxed);
        return PutWordOutcome::Full { key_word, value_word };
      }

      if !condition.accepts(prior) {
        unsafe { V::take(value_word) };
        return PutWordOutcome::Rejected;
      }

      match slot.value.compare_exchange_weak(prior, value_word, AcqRel, Acquire) {
        Ok(_) => {
          let was_absent = is_absent::<V>(prior);
          let is_absent_now = is_absent::<V>(V::Sentinel::pure(value_word));

          match (was_absent, is_absent_now) {
            (true, false) => {
              self.alive.fetch_add(1, Relaxed);
            }
            (false, true) => {
              self.alive.fetch_sub(1, Relaxed);
            }
            _ => {}
          }

          if !was_absent {
            // SAFETY: `prior` was a live value installed by a prior `take`d
            // payload, never read again after this CAS.
            unsafe { V::take(prior) };
          }

          return PutWordOutcome::Applied { was_insert: was_absent };
        }
        Err(_) => continue,
      }
    }
  }

  /// Finishes migrating one slot's value into the successor chain, per the
  /// six-case algorithm: mark-copying, then dispatch on the pure value that
  /// was there a moment before the mark landed.
  pub(crate) fn copy<S>(&self, idx: usize, host: &Inner<K, V, S>, guard: &GuardRecord)
  where
    K: core::hash::Hash,
    S: core::hash::BuildHasher,
  {
    // SAFETY: `idx` is always caller-supplied from a prior `self.lookup` or
    // from `do_copy_task`'s `0..size` sweep.
    let slot = unsafe { self.slots.get_unchecked(idx) };
    let before = V::Sentinel::mark_copying(&slot.value);
    let v = V::Sentinel::pure(before);

    if v == V::Sentinel::COPIED || v == V::Sentinel::DELETED {
      return;
    }

    if v == V::Sentinel::BABY {
      slot.value.store(V::Sentinel::COPIED | V::Sentinel::COPYING_BIT, Release);
      return;
    }

    if v == V::Sentinel::NONE {
      slot.value.store(V::Sentinel::DELETED | V::Sentinel::COPYING_BIT, Release);
      return;
    }

    let key_word = slot.key.load(Relaxed);
    let peeked = unsafe { K::peek(key_word) };
    let hash = host.hash_of(&peeked);
    #[allow(undropped_manually_drops)]
    drop(peeked);

    let mut forward_key = key_word;
    let mut forward_value = v;

    self.ensure_successor_ready(host);
    let mut successor_ptr = self.next.load(Acquire);
    debug_assert!(!successor_ptr.is_null());

    loop {
      // SAFETY: a generation's `next` is set once and never freed while this
      // generation (and hence any slot inside it) is reachable.
      let successor = unsafe { &*successor_ptr };

      match successor.put_word(forward_key, forward_value, hash, PutCondition::Copying, host, guard) {
        PutWordOutcome::Full { key_word, value_word } => {
          forward_key = key_word;
          forward_value = value_word;
          // The immediate successor is itself saturated; walk the chain
          // onto *its* successor, creating one if it doesn't have one yet,
          // instead of resubmitting to the same full generation forever.
          successor.ensure_next(host);
          successor_ptr = successor.next_ptr();
          debug_assert!(!successor_ptr.is_null());
          continue;
        }
        PutWordOutcome::Applied { .. } | PutWordOutcome::Rejected => break,
      }
    }

    slot.value.store(V::Sentinel::COPIED | V::Sentinel::COPYING_BIT, Release);
  }

  fn ensure_successor_ready<S>(&self, host: &Inner<K, V, S>) {
    self.ensure_next(host);
  }

  /// Creates this generation's successor if it doesn't already have one.
  /// Double-checked under `next_lock` so only the first caller pays for the
  /// allocation.
  pub(crate) fn ensure_next<S>(&self, host: &Inner<K, V, S>) {
    if self.has_next() {
      return;
    }

    let held = self.next_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if self.has_next() {
      return;
    }

    let alive = self.alive.load(Relaxed).max(0) as usize;
    let target = ((alive as f64) / self.density).ceil().max(1.0) as usize;
    let successor_size = target.next_power_of_two();

    let number = host.next_generation_number();
    let successor = Box::into_raw(Box::new(Generation::new(successor_size, number, self.density)));

    let this_size = self.size();
    let log2 = this_size.trailing_zeros() as usize;
    let task_a = log2 + 1;
    let task_b = ((2.0 * this_size as f64) / (self.density * successor_size as f64 + 1.0)).ceil().max(1.0) as usize;
    self.copy_task_size.store(task_a.max(task_b).max(1), Relaxed);

    self.next.store(successor, Release);
    drop(held);
  }

  fn is_head<S>(&self, host: &Inner<K, V, S>) -> bool {
    core::ptr::eq(host.head_ptr(), self as *const Self)
  }

  /// Copies one slice of slots into the successor, cooperating with every
  /// other thread that also observes `head.next ≠ null`. Retires this
  /// generation once every slot has been visited.
  pub(crate) fn do_copy_task<S>(&self, host: &Inner<K, V, S>, guard: &GuardRecord)
  where
    K: core::hash::Hash,
    S: core::hash::BuildHasher,
  {
    if !self.is_head(host) {
      return;
    }

    let size = self.size();

    if self.copied.load(Acquire) >= size {
      self.try_retire(host);
      return;
    }

    guard.set_forbid_reclaim(true);

    if !self.is_head(host) {
      guard.set_forbid_reclaim(false);
      return;
    }

    let task_size = self.copy_task_size.load(Relaxed).max(1);
    let start = self.copied.fetch_add(task_size, AcqRel);

    if start < size {
      let end = size.min(start + task_size);
      for index in start..end {
        self.copy(index, host, guard);
      }
    }

    guard.set_forbid_reclaim(false);

    if self.copied.load(Acquire) >= size {
      self.try_retire(host);
    }
  }

  fn try_retire<S>(&self, host: &Inner<K, V, S>) {
    let next = self.next.load(Acquire);
    debug_assert!(!next.is_null(), "a fully-copied generation must have a successor");

    let this_ptr = self as *const Self as *mut Self;
    host.retire(this_ptr, next);
  }
}

impl<K, V> Drop for Generation<K, V>
where
  K: Payload,
  V: Payload,
{
  fn drop(&mut self) {
    if !core::mem::needs_drop::<K>() && !core::mem::needs_drop::<V>() {
      return;
    }

    for slot in self.slots.as_slice() {
      let value_word = slot.value.load(Relaxed);
      let pure_value = V::Sentinel::pure(value_word);

      // The value (and the key alongside it) was physically forwarded to a
      // later generation; this generation no longer owns either payload.
      if pure_value == V::Sentinel::COPIED {
        continue;
      }

      let key_word = slot.key.load(Relaxed);
      if key_word != K::Sentinel::NONE {
        unsafe { K::take(key_word) };
      }

      if pure_value != V::Sentinel::NONE && pure_value != V::Sentinel::BABY && pure_value != V::Sentinel::DELETED {
        unsafe { V::take(pure_value) };
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Density;
  use crate::map::Map;

  #[test]
  fn single_slot_generation_accepts_one_key() {
    let map: Map<u64, u64> = crate::config::Config::new().initial_size(1).density(Density::default().as_f64()).build();
    assert!(map.put_if_absent(1, 100));
    assert_eq!(map.get(&1), Some(100));
  }

  #[test]
  fn upper_key_count_bound_matches_formula() {
    let generation: Generation<u64, u64> = Generation::new(16, 0, 0.5);
    // min(0.7, 2*0.5) = 0.7; ceil(0.7 * 16) = 12
    assert_eq!(generation.upper_key_count_bound(), 12);
  }

  #[test]
  fn fresh_generation_is_not_full() {
    let generation: Generation<u64, u64> = Generation::new(8, 0, 0.5);
    assert!(!generation.is_full());
    assert!(!generation.has_next());
  }

  #[test]
  fn filling_past_the_density_bound_triggers_a_successor() {
    let map: Map<u64, u64> = crate::config::Config::new().initial_size(4).density(0.5).build();
    for key in 0..32u64 {
      map.put(key, key * 10);
    }
    for key in 0..32u64 {
      assert_eq!(map.get(&key), Some(key * 10));
    }
  }

  #[test]
  fn delete_then_reinsert_same_key_is_visible() {
    let map: Map<u64, u64> = Map::new();
    map.put(1, 100);
    assert!(map.delete(1));
    assert_eq!(map.get(&1), None);
    assert!(map.put_if_absent(1, 200));
    assert_eq!(map.get(&1), Some(200));
  }

  #[test]
  fn copying_slot_is_invisible_to_snapshot_iteration() {
    let generation: Generation<u64, u64> = Generation::new(8, 0, 0.5);
    // A freshly constructed generation has every slot at BABY, which is not
    // a live entry.
    assert!(generation.iter_slot(0).is_none());
  }
}
