//! Hand-rolled epoch-based reclamation: guard records and the guard list.
//!
//! Each thread that touches a [`crate::Map`] owns one [`GuardRecord`],
//! handed out by a [`GuardList`] that never removes a record once
//! allocated — only recycles it when its owning thread calls
//! `forget_thread`. A record's `guarded_generation` field publishes, to
//! every other thread, the oldest table generation this thread might still
//! be dereferencing; the minimum of that field across all claimed records is
//! the watermark below which a retired generation is safe to free.

use core::ptr;
use core::ptr::NonNull;

use crate::padded::CachePadded;
use crate::sync::atomic::AtomicBool;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::AtomicUsize;
use crate::sync::atomic::Ordering;

/// Sentinel `guarded_generation` meaning "this thread is not currently
/// dereferencing any table generation".
pub(crate) const NO_GENERATION: usize = usize::MAX;

/// One thread's pin state against a single map.
pub(crate) struct GuardRecord {
  claimed: AtomicBool,
  pin_depth: AtomicUsize,
  guarded_generation: CachePadded<AtomicUsize>,
  forbid_reclaim: AtomicBool,
  key_installs: AtomicUsize,
  next: AtomicPtr<GuardRecord>,
}

impl GuardRecord {
  fn new(claimed: bool) -> Self {
    Self {
      claimed: AtomicBool::new(claimed),
      pin_depth: AtomicUsize::new(0),
      guarded_generation: CachePadded::new(AtomicUsize::new(NO_GENERATION)),
      forbid_reclaim: AtomicBool::new(false),
      key_installs: AtomicUsize::new(0),
      next: AtomicPtr::new(ptr::null_mut()),
    }
  }

  /// Pins this record to `generation`, publishing it with a full fence so no
  /// later load in this thread can be reordered before the publication is
  /// visible to a concurrent reclaimer. Reentrant: nested pins only publish
  /// on the outermost call.
  pub(crate) fn pin(&self, generation: usize) {
    if self.pin_depth.fetch_add(1, Ordering::Relaxed) == 0 {
      self.guarded_generation.store(generation, Ordering::Relaxed);
      crate::sync::atomic::fence(Ordering::SeqCst);
    }
  }

  /// Reverses one [`GuardRecord::pin`]. Only the outermost unpin clears the
  /// published generation.
  pub(crate) fn unpin(&self) {
    if self.pin_depth.fetch_sub(1, Ordering::Relaxed) == 1 {
      self.guarded_generation.store(NO_GENERATION, Ordering::Release);
    }
  }

  pub(crate) fn forbid_reclaim(&self) -> bool {
    self.forbid_reclaim.load(Ordering::Acquire)
  }

  pub(crate) fn set_forbid_reclaim(&self, value: bool) {
    self.forbid_reclaim.store(value, Ordering::Release);
  }

  pub(crate) fn note_key_installed(&self) {
    self.key_installs.fetch_add(1, Ordering::Relaxed);
  }
}

/// A lock-free, never-shrinking list of guard records, one per map.
pub(crate) struct GuardList {
  head: AtomicPtr<GuardRecord>,
}

impl GuardList {
  pub(crate) const fn new() -> Self {
    Self {
      head: AtomicPtr::new(ptr::null_mut()),
    }
  }

  /// Claims a free record, or allocates and links in a new one.
  pub(crate) fn acquire(&self) -> NonNull<GuardRecord> {
    let mut cursor = self.head.load(Ordering::Acquire);

    while !cursor.is_null() {
      // SAFETY: records are never freed once linked into this list.
      let record = unsafe { &*cursor };

      if !record.claimed.swap(true, Ordering::AcqRel) {
        // SAFETY: `cursor` is non-null and we just verified it's ours.
        return unsafe { NonNull::new_unchecked(cursor) };
      }

      cursor = record.next.load(Ordering::Acquire);
    }

    let fresh = Box::into_raw(Box::new(GuardRecord::new(true)));
    let mut head = self.head.load(Ordering::Acquire);

    loop {
      // SAFETY: `fresh` was just allocated and is not yet shared.
      unsafe { (*fresh).next.store(head, Ordering::Relaxed) };

      match self.head.compare_exchange_weak(head, fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => break,
        Err(actual) => head = actual,
      }
    }

    // SAFETY: `fresh` is a just-allocated, non-null pointer.
    unsafe { NonNull::new_unchecked(fresh) }
  }

  /// Returns `record` to the free pool. The allocation itself is kept.
  pub(crate) fn release(&self, record: NonNull<GuardRecord>) {
    // SAFETY: `record` was returned by `acquire` and outlives this call.
    let record = unsafe { record.as_ref() };
    record.guarded_generation.store(NO_GENERATION, Ordering::Release);
    record.pin_depth.store(0, Ordering::Relaxed);
    record.forbid_reclaim.store(false, Ordering::Relaxed);
    record.claimed.store(false, Ordering::Release);
  }

  fn for_each(&self, mut f: impl FnMut(&GuardRecord, bool)) {
    let mut cursor = self.head.load(Ordering::Acquire);

    while !cursor.is_null() {
      // SAFETY: records are never freed once linked into this list.
      let record = unsafe { &*cursor };
      f(record, record.claimed.load(Ordering::Acquire));
      cursor = record.next.load(Ordering::Acquire);
    }
  }

  /// The minimum `guarded_generation` across every currently-claimed record,
  /// or `NO_GENERATION` if none is claimed or none is pinned.
  pub(crate) fn min_guarded_generation(&self) -> usize {
    let mut min = NO_GENERATION;

    self.for_each(|record, claimed| {
      if claimed {
        min = min.min(record.guarded_generation.load(Ordering::Acquire));
      }
    });

    min
  }

  /// Whether any claimed record is currently inside a forbid-reclaim
  /// section (i.e. mid [`crate::table::Generation::do_copy_task`]).
  pub(crate) fn any_forbid_reclaim(&self) -> bool {
    let mut forbidden = false;

    self.for_each(|record, claimed| {
      forbidden |= claimed && record.forbid_reclaim();
    });

    forbidden
  }

}

impl Drop for GuardList {
  fn drop(&mut self) {
    let mut cursor = self.head.load(Ordering::Relaxed);

    while !cursor.is_null() {
      // SAFETY: every record in the list was allocated with `Box::into_raw`
      // and this is the only remaining reference (the map is being dropped).
      let record = unsafe { Box::from_raw(cursor) };
      cursor = record.next.load(Ordering::Relaxed);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_links_records_and_release_frees_for_reuse() {
    let list = GuardList::new();
    let a = list.acquire();
    let b = list.acquire();
    assert_ne!(a, b);

    list.release(a);
    let c = list.acquire();
    assert_eq!(a, c, "a released record should be recycled before allocating a new one");
  }

  #[test]
  fn pin_unpin_is_reentrant() {
    let list = GuardList::new();
    let record = list.acquire();
    let record = unsafe { record.as_ref() };

    record.pin(5);
    record.pin(5);
    assert_eq!(record.guarded_generation.load(Ordering::Relaxed), 5);
    record.unpin();
    assert_eq!(record.guarded_generation.load(Ordering::Relaxed), 5, "inner unpin must not clear");
    record.unpin();
    assert_eq!(record.guarded_generation.load(Ordering::Relaxed), NO_GENERATION);
  }

  #[test]
  fn min_guarded_generation_ignores_unpinned_and_released_records() {
    let list = GuardList::new();
    let a = list.acquire();
    let b = list.acquire();

    unsafe { a.as_ref() }.pin(10);
    unsafe { b.as_ref() }.pin(3);
    assert_eq!(list.min_guarded_generation(), 3);

    list.release(b);
    assert_eq!(list.min_guarded_generation(), 10);
  }

}
