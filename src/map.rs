//! The public map facade and its internal generation-chain owner.

use core::cell::RefCell;
use core::fmt;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::sync::Arc;

use crate::condition::Condition;
use crate::config::Config;
use crate::config::Density;
use crate::guard::GuardList;
use crate::guard::GuardRecord;
use crate::guard::NO_GENERATION;
use crate::payload::Payload;
use crate::sentinel::Sentinel;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::AtomicUsize;
use crate::sync::atomic::Ordering::AcqRel;
use crate::sync::atomic::Ordering::Acquire;
use crate::sync::atomic::Ordering::Relaxed;
use crate::table::Generation;
use crate::table::GetWordOutcome;
use crate::table::PutCondition;
use crate::table::PutWordOutcome;

/// Every thread that touches any [`Map`] keeps at most one claimed
/// [`GuardRecord`] per distinct map, keyed by that map's [`GuardList`]
/// identity. The `Arc<GuardList>` clone held alongside each record keeps the
/// list (and hence the record) alive even if every `Map` handle referring to
/// it is dropped before this thread calls [`Map::forget_thread`] or exits.
struct ThreadGuardTable {
  entries: HashMap<usize, (Arc<GuardList>, NonNull<GuardRecord>)>,
}

impl Drop for ThreadGuardTable {
  fn drop(&mut self) {
    for (_, (list, record)) in self.entries.drain() {
      list.release(record);
    }
  }
}

thread_local! {
  static THREAD_GUARDS: RefCell<ThreadGuardTable> = RefCell::new(ThreadGuardTable { entries: HashMap::new() });
}

/// A retired generation awaiting the minimum guarded generation to pass it
/// by. Forms a singly-linked stack rooted at [`Inner::head_to_delete`],
/// separate from the live chain rooted at [`Inner::head`].
struct RetireNode<K, V>
where
  K: Payload,
  V: Payload,
{
  generation: NonNull<Generation<K, V>>,
  next: AtomicPtr<RetireNode<K, V>>,
}

/// The shared state behind every [`Map`] handle: the live generation chain,
/// the retirement stack, and the guard list that protects both.
pub(crate) struct Inner<K, V, S = RandomState>
where
  K: Payload,
  V: Payload,
{
  head: AtomicPtr<Generation<K, V>>,
  head_to_delete: AtomicPtr<RetireNode<K, V>>,
  next_generation: AtomicUsize,
  last_retired_generation: AtomicUsize,
  #[allow(dead_code)]
  density: Density,
  hasher: S,
  guards: Arc<GuardList>,
}

impl<K, V, S> Inner<K, V, S>
where
  K: Hash + Payload,
  V: Payload,
  S: BuildHasher,
{
  pub(crate) fn hash_of(&self, key: &K) -> u64 {
    self.hasher.hash_one(key)
  }
}

impl<K, V, S> Inner<K, V, S>
where
  K: Payload + PartialEq,
  V: Payload + PartialEq,
{
  pub(crate) fn next_generation_number(&self) -> usize {
    self.next_generation.fetch_add(1, Relaxed)
  }

  pub(crate) fn head_ptr(&self) -> *const Generation<K, V> {
    self.head.load(Acquire)
  }

  /// Swaps `old` out of the live chain for `new_head`, then pushes `old`
  /// onto the retirement stack. Called by a generation once it has finished
  /// copying every slot into its successor.
  pub(crate) fn retire(&self, old: *mut Generation<K, V>, new_head: *mut Generation<K, V>) {
    if self.head.compare_exchange(old, new_head, AcqRel, Acquire).is_err() {
      // Another thread already swung `head` forward (or retired this
      // generation); nothing left for us to do.
      return;
    }

    // SAFETY: `old` just came out of `head` and is a valid, still-allocated
    // generation; `retire` is only called once per generation (guarded by
    // the CAS above, which only one thread can win).
    let generation_number = unsafe { (*old).number };
    let node = Box::into_raw(Box::new(RetireNode {
      generation: NonNull::new(old).expect("retired generation pointer is non-null"),
      next: AtomicPtr::new(core::ptr::null_mut()),
    }));

    let mut head = self.head_to_delete.load(Acquire);
    loop {
      // SAFETY: `node` was just allocated and is not yet shared.
      unsafe { (*node).next.store(head, Relaxed) };

      match self.head_to_delete.compare_exchange_weak(head, node, AcqRel, Acquire) {
        Ok(_) => break,
        Err(actual) => head = actual,
      }
    }

    self.last_retired_generation.fetch_max(generation_number, AcqRel);
  }

  /// The exact four-step reclamation sequence: snapshot, bail if anything in
  /// the retired batch might still be visible, take the batch with a single
  /// CAS, and either free it or (on an ABA-style race) put it back.
  pub(crate) fn try_reclaim(&self) {
    if self.guards.any_forbid_reclaim() {
      return;
    }

    let old_head = self.head.load(Acquire);

    let to_delete = self.head_to_delete.load(Acquire);
    if to_delete.is_null() {
      return;
    }

    let last_retired = self.last_retired_generation.load(Acquire);
    let min_guarded = self.guards.min_guarded_generation();

    if min_guarded != NO_GENERATION && last_retired >= min_guarded {
      return;
    }

    if self.head_to_delete.compare_exchange(to_delete, core::ptr::null_mut(), AcqRel, Acquire).is_err() {
      return;
    }

    if self.head.load(Acquire) != old_head {
      // `head` advanced between our snapshot and winning the CAS above: a
      // concurrent `retire` may have pushed a generation onto this exact
      // batch after we last checked `min_guarded_generation` against it.
      // Put the batch back rather than risk freeing something still
      // reachable; a later `try_reclaim` call re-validates it from scratch.
      self.reinstate(to_delete);
      return;
    }

    // We now exclusively own the `to_delete` batch. Free every node and its
    // generation.
    let mut cursor = to_delete;
    while !cursor.is_null() {
      // SAFETY: we uniquely own this batch after the CAS above; each node
      // was allocated with `Box::into_raw` and is freed exactly once.
      let node = unsafe { Box::from_raw(cursor) };
      cursor = node.next.load(Relaxed);
      // SAFETY: the generation pointer was moved out of the live chain by
      // `retire` and is not reachable from anywhere but this retired batch.
      unsafe { drop(Box::from_raw(node.generation.as_ptr())) };
    }
  }

  /// CAS-prepends a batch this call uniquely owns (taken out of
  /// `head_to_delete` by `try_reclaim`) back onto `head_to_delete`, ahead of
  /// whatever has been retired since.
  fn reinstate(&self, batch: *mut RetireNode<K, V>) {
    let mut tail = batch;
    loop {
      // SAFETY: `batch` is a chain this call uniquely owns; walking `next`
      // only ever reaches further nodes in that same chain.
      let next = unsafe { (*tail).next.load(Relaxed) };
      if next.is_null() {
        break;
      }
      tail = next;
    }

    let mut head = self.head_to_delete.load(Acquire);
    loop {
      // SAFETY: `tail` is the last node of a chain this call uniquely owns.
      unsafe { (*tail).next.store(head, Relaxed) };

      match self.head_to_delete.compare_exchange_weak(head, batch, AcqRel, Acquire) {
        Ok(_) => break,
        Err(actual) => head = actual,
      }
    }
  }

}

impl<K, V, S> Drop for Inner<K, V, S>
where
  K: Payload,
  V: Payload,
{
  fn drop(&mut self) {
    let mut cursor = self.head_to_delete.load(Relaxed);
    while !cursor.is_null() {
      // SAFETY: nothing else can reach the retired batch once the map is
      // being dropped.
      let node = unsafe { Box::from_raw(cursor) };
      cursor = node.next.load(Relaxed);
      unsafe { drop(Box::from_raw(node.generation.as_ptr())) };
    }

    let head = self.head.load(Relaxed);
    if !head.is_null() {
      // SAFETY: `head` is still live and uniquely owned by this `Inner`.
      unsafe { drop(Box::from_raw(head)) };
    }
  }
}

/// A concurrent, lock-free hash map with incremental resizing.
///
/// See the [crate-level documentation](crate) for the concurrency model.
/// Keys and values must implement [`crate::payload::Payload`]: unsigned
/// integers implement it directly, and `Box<T>` implements it for arbitrary
/// owned types.
///
/// ```
/// use scalemap::Map;
///
/// let map: Map<u64, u64> = Map::new();
/// assert!(map.put_if_absent(1, 100));
/// assert_eq!(map.get(&1), Some(100));
/// assert!(!map.put_if_absent(1, 200));
/// assert!(map.put_if_exists(1, 200));
/// assert_eq!(map.get(&1), Some(200));
/// ```
pub struct Map<K, V, S = RandomState>
where
  K: Payload,
  V: Payload,
{
  inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for Map<K, V, S>
where
  K: Payload,
  V: Payload,
{
  fn clone(&self) -> Self {
    Self { inner: Arc::clone(&self.inner) }
  }
}

impl<K, V> Map<K, V>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
{
  /// Builds a map with the crate's default configuration.
  #[must_use]
  pub fn new() -> Self {
    Self::with_config(Config::new())
  }

  /// Builds a map using `config`'s initial size and density, and `std`'s
  /// default hasher.
  #[must_use]
  pub fn with_config(config: Config) -> Self {
    Self::with_config_and_hasher(config, RandomState::new())
  }
}

impl<K, V> Default for Map<K, V>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, S> Map<K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  /// Builds a map using `config` and a caller-supplied hasher builder.
  #[must_use]
  pub fn with_config_and_hasher(config: Config, hasher: S) -> Self {
    let size = config.resolved_initial_size();
    let density = config.resolved_density();
    let generation = Box::new(Generation::new(size, 0, density.as_f64()));

    let inner = Arc::new(Inner {
      head: AtomicPtr::new(Box::into_raw(generation)),
      head_to_delete: AtomicPtr::new(core::ptr::null_mut()),
      next_generation: AtomicUsize::new(1),
      last_retired_generation: AtomicUsize::new(0),
      density,
      hasher,
      guards: Arc::new(GuardList::new()),
    });

    Self { inner }
  }

  fn guard_list_identity(&self) -> usize {
    Arc::as_ptr(&self.inner.guards) as usize
  }

  /// Binds the calling thread to this map, allocating (or reusing) its
  /// [`crate::guard::GuardRecord`] up front and holding it for the thread's
  /// lifetime or until [`Map::forget_thread`]. Idempotent per thread.
  /// Calling this before the first operation avoids paying the allocation
  /// on the hot path; it is optional otherwise, since every operation binds
  /// implicitly on first use.
  pub fn register_thread(&self) {
    self.with_guard(|_| ());
  }

  /// Releases the calling thread's guard slot for this map back to the
  /// pool. A later operation on this thread rebinds a (possibly different)
  /// record automatically.
  pub fn forget_thread(&self) {
    let key = self.guard_list_identity();

    THREAD_GUARDS.with(|cell| {
      if let Some((list, record)) = cell.borrow_mut().entries.remove(&key) {
        list.release(record);
      }
    });
  }

  /// Runs `f` with this thread's guard record for this map, binding one on
  /// first use. The record is never released between calls — only
  /// `forget_thread` or thread exit gives it back.
  pub(crate) fn with_guard<R>(&self, f: impl FnOnce(&GuardRecord) -> R) -> R {
    let key = self.guard_list_identity();

    THREAD_GUARDS.with(|cell| {
      let mut table = cell.borrow_mut();
      let record = match table.entries.get(&key) {
        Some((_, record)) => *record,
        None => {
          let acquired = self.inner.guards.acquire();
          table.entries.insert(key, (Arc::clone(&self.inner.guards), acquired));
          acquired
        }
      };
      drop(table);

      // SAFETY: the `Arc<GuardList>` clone held in `THREAD_GUARDS` keeps the
      // list (and this claimed record) alive until this thread releases it.
      f(unsafe { record.as_ref() })
    })
  }

  /// Looks up `key`, returning a clone of its current value if present.
  pub fn get(&self, key: &K) -> Option<V>
  where
    V: Clone,
  {
    self.with_guard(|guard| self.get_with_guard(key, guard))
  }

  fn get_with_guard(&self, key: &K, guard: &GuardRecord) -> Option<V>
  where
    V: Clone,
  {
    let hash = self.inner.hash_of(key);
    let mut current = self.inner.head.load(Acquire);

    loop {
      // SAFETY: `current` is non-null while the map exists and is kept
      // alive by pinning before dereferencing it.
      let generation = unsafe { &*current };
      guard.pin(generation.number);

      let outcome = generation.get_word(key, hash, &self.inner, guard);

      let result = match outcome {
        GetWordOutcome::Found(pure) => {
          // SAFETY: `pure` is a live value word owned by the slot; `peek`
          // does not disturb it.
          let value = unsafe { V::peek(pure) };
          Some((*value).clone())
        }
        GetWordOutcome::NotFound => None,
        GetWordOutcome::Consult => {
          guard.unpin();
          if !generation.has_next() {
            generation.ensure_next(&self.inner);
          }
          generation.do_copy_task(&self.inner, guard);
          current = generation.next_ptr();
          self.inner.try_reclaim();
          continue;
        }
      };

      guard.unpin();

      if !generation.has_next() && generation.is_full() {
        generation.ensure_next(&self.inner);
      }
      if generation.has_next() {
        generation.do_copy_task(&self.inner, guard);
      }

      self.inner.try_reclaim();
      return result;
    }
  }

  /// Applies `condition` to `key`/`value`, returning whether it took effect.
  pub fn put_with_condition(&self, key: K, value: V, condition: Condition<V>) -> bool {
    self.with_guard(|guard| self.put_with_guard(key, value, condition, guard))
  }

  /// Unconditionally installs `value` for `key`, overwriting any prior
  /// value.
  pub fn put(&self, key: K, value: V) -> bool {
    self.put_with_condition(key, value, Condition::Always)
  }

  /// Installs `value` for `key` only if `key` has no live value.
  pub fn put_if_absent(&self, key: K, value: V) -> bool {
    self.put_with_condition(key, value, Condition::IfAbsent)
  }

  /// Installs `value` for `key` only if `key` already has a live value.
  pub fn put_if_exists(&self, key: K, value: V) -> bool {
    self.put_with_condition(key, value, Condition::IfExists)
  }

  /// Installs `value` for `key` only if `key`'s current live value equals
  /// `expected`.
  pub fn put_if_match(&self, key: K, value: V, expected: V) -> bool {
    self.put_with_condition(key, value, Condition::IfMatches(expected))
  }

  /// Removes `key`'s current value, if it has one.
  pub fn delete(&self, key: K) -> bool {
    let table_condition = PutCondition::IfExists;
    self.with_guard(|guard| self.apply_raw(key, V::Sentinel::NONE, table_condition, guard))
  }

  /// Removes `key`'s current value only if it equals `expected`.
  pub fn delete_if_match(&self, key: K, expected: V) -> bool {
    let table_condition = PutCondition::IfMatches(&expected);
    self.with_guard(|guard| self.apply_raw(key, V::Sentinel::NONE, table_condition, guard))
  }

  fn put_with_guard(&self, key: K, value: V, condition: Condition<V>, guard: &GuardRecord) -> bool {
    let value_word = value.into_word();
    let table_condition = match &condition {
      Condition::Always => PutCondition::Always,
      Condition::IfAbsent => PutCondition::IfAbsent,
      Condition::IfExists => PutCondition::IfExists,
      Condition::IfMatches(expected) => PutCondition::IfMatches(expected),
    };
    self.apply_raw(key, value_word, table_condition, guard)
  }

  /// Drives a single word-level put (a real value, or the `NONE` sentinel
  /// for a delete) through the generation chain, helping migrate and
  /// reclaim along the way exactly as [`Map::get`] does.
  fn apply_raw(&self, key: K, mut value_word: usize, table_condition: PutCondition<'_, V>, guard: &GuardRecord) -> bool {
    let hash = self.inner.hash_of(&key);
    let mut key_word = key.into_word();
    let mut current = self.inner.head.load(Acquire);

    loop {
      // SAFETY: see `get_with_guard`.
      let generation = unsafe { &*current };
      guard.pin(generation.number);

      let outcome = generation.put_word(key_word, value_word, hash, table_condition, &self.inner, guard);

      let applied = match outcome {
        PutWordOutcome::Applied { .. } => true,
        PutWordOutcome::Rejected => false,
        PutWordOutcome::Full { key_word: k, value_word: v } => {
          key_word = k;
          value_word = v;
          guard.unpin();
          generation.ensure_next(&self.inner);
          generation.do_copy_task(&self.inner, guard);
          current = generation.next_ptr();
          self.inner.try_reclaim();
          continue;
        }
      };

      guard.unpin();

      if !generation.has_next() && generation.is_full() {
        generation.ensure_next(&self.inner);
      }
      if generation.has_next() {
        generation.do_copy_task(&self.inner, guard);
      }

      self.inner.try_reclaim();
      return applied;
    }
  }

  /// The exact number of live keys, found by walking every generation.
  /// Not thread-safe against concurrent writers: a put or delete racing this
  /// walk can be observed, missed, or (across a migration) counted twice.
  pub fn size(&self) -> usize
  where
    K: Clone,
    V: Clone,
  {
    self.iter().count()
  }

  pub(crate) fn head_ptr(&self) -> *const Generation<K, V> {
    self.inner.head_ptr()
  }

  /// A single-threaded, snapshot-style iterator over every live entry.
  ///
  /// Walks each generation's slots in probe order, following `next` at the
  /// end of one generation, skipping any slot whose value is a reserved
  /// sentinel or is mid-migration. No stability guarantee under concurrent
  /// mutation: an entry may be seen once, not at all, or (across a
  /// migration) briefly twice.
  pub fn iter(&self) -> crate::iter::Iter<'_, K, V, S>
  where
    K: Clone,
    V: Clone,
  {
    crate::iter::Iter::new(self)
  }

  /// Copies every live entry from `other` into `self` via [`Map::put`].
  ///
  /// Snapshots `other` through a single-threaded [`Map::iter`] pass; calling
  /// this while `other` has concurrent writers can miss or duplicate entries
  /// the same way a plain `iter()` consumer would.
  pub fn put_all_from(&self, other: &Map<K, V, S>)
  where
    K: Clone,
    V: Clone,
  {
    for (key, value) in other.iter() {
      self.put(key, value);
    }
  }

  /// Pins the calling thread to this map's current head generation for the
  /// returned value's lifetime. Required before calling any `_no_guarding`
  /// operation; dropping it unpins.
  #[must_use]
  pub fn pin(&self) -> ScopedPin<'_, K, V, S> {
    ScopedPin::new(self)
  }

  /// Equivalent to [`Map::get`], but assumes the calling thread is already
  /// pinned via a held [`ScopedPin`] instead of pinning/unpinning itself.
  ///
  /// # Panics
  ///
  /// Does not panic, but reading through a stale or foreign pin is a logic
  /// error: the `_pin` parameter exists only to prove one is held.
  pub fn get_no_guarding(&self, key: &K, _pin: &ScopedPin<'_, K, V, S>) -> Option<V>
  where
    V: Clone,
  {
    self.with_guard(|guard| self.get_with_guard(key, guard))
  }

  /// Equivalent to [`Map::put_with_condition`], assuming an active
  /// [`ScopedPin`] in place of this call's own pin/unpin.
  pub fn put_no_guarding(&self, key: K, value: V, condition: Condition<V>, _pin: &ScopedPin<'_, K, V, S>) -> bool {
    self.with_guard(|guard| self.put_with_guard(key, value, condition, guard))
  }

  /// Equivalent to [`Map::delete`], assuming an active [`ScopedPin`] in place
  /// of this call's own pin/unpin.
  pub fn delete_no_guarding(&self, key: K, _pin: &ScopedPin<'_, K, V, S>) -> bool {
    let table_condition = PutCondition::IfExists;
    self.with_guard(|guard| self.apply_raw(key, V::Sentinel::NONE, table_condition, guard))
  }
}

/// A scoped pin obtained from [`Map::pin`]. While held, the calling thread is
/// pinned to the map's head generation; required before using any
/// `_no_guarding` operation, which otherwise behaves exactly like its
/// guarding counterpart.
pub struct ScopedPin<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  map: &'a Map<K, V, S>,
}

impl<'a, K, V, S> ScopedPin<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  fn new(map: &'a Map<K, V, S>) -> Self {
    map.with_guard(|guard| {
      // SAFETY: `head_ptr` is non-null while the map exists.
      let head = unsafe { &*map.head_ptr() };
      guard.pin(head.number);
    });

    Self { map }
  }
}

impl<'a, K, V, S> Drop for ScopedPin<'a, K, V, S>
where
  K: Payload + Eq + Hash + PartialEq,
  V: Payload + PartialEq,
  S: BuildHasher,
{
  fn drop(&mut self) {
    self.map.with_guard(|guard| guard.unpin());
  }
}

impl<K, V, S> fmt::Debug for Map<K, V, S>
where
  K: Payload + Eq + Hash + PartialEq + Clone + fmt::Debug,
  V: Payload + PartialEq + Clone + fmt::Debug,
  S: BuildHasher,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_map().entries(self.iter()).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn put_if_exists_rejects_absent_key() {
    let map: Map<u64, u64> = Map::new();
    assert!(!map.put_if_exists(1, 100));
    assert_eq!(map.get(&1), None);
  }

  #[test]
  fn put_if_match_rejects_wrong_expected_value() {
    let map: Map<u64, u64> = Map::new();
    map.put(1, 100);
    assert!(!map.put_if_match(1, 200, 999));
    assert_eq!(map.get(&1), Some(100));
  }

  #[test]
  fn delete_if_match_rejects_wrong_expected_value() {
    let map: Map<u64, u64> = Map::new();
    map.put(1, 100);
    assert!(!map.delete_if_match(1, 999));
    assert_eq!(map.get(&1), Some(100));
  }

  #[test]
  fn size_tracks_puts_and_deletes() {
    let map: Map<u64, u64> = Map::new();
    assert_eq!(map.size(), 0);
    map.put(1, 10);
    map.put(2, 20);
    assert_eq!(map.size(), 2);
    map.delete(1);
    assert_eq!(map.size(), 1);
  }

  #[test]
  fn register_and_forget_thread_are_idempotent() {
    let map: Map<u64, u64> = Map::new();
    map.register_thread();
    map.register_thread();
    map.forget_thread();
    map.forget_thread();
    assert!(map.put_if_absent(1, 1));
  }

  #[test]
  fn clone_shares_the_same_backing_map() {
    let map: Map<u64, u64> = Map::new();
    let handle = map.clone();
    handle.put(1, 100);
    assert_eq!(map.get(&1), Some(100));
  }

  #[test]
  fn debug_format_lists_live_entries() {
    let map: Map<u64, u64> = Map::new();
    map.put(1, 100);
    let rendered = format!("{map:?}");
    assert!(rendered.contains('1'));
    assert!(rendered.contains("100"));
  }
}
