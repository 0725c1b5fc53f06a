//! Backend-agnostic re-exports of the atomic primitives used throughout the
//! crate. Three backends are supported, selected at compile time and never
//! mixed:
//!
//! - plain `core`/`std` atomics (the default, used in production),
//! - [`loom`], which explores thread interleavings exhaustively under a
//!   model checker,
//! - [`shuttle`], which explores interleavings via randomized scheduling.
//!
//! Production code never references `core::sync::atomic` or `loom`/`shuttle`
//! directly; it goes through `crate::sync::atomic` so the same algorithm runs
//! unmodified under all three backends.

#[cfg(all(loom, shuttle))]
compile_error!("cannot use loom and shuttle at once");

#[cfg(not(any(loom, shuttle)))]
mod exports {
  pub(crate) mod atomic {
    pub(crate) use ::core::sync::atomic::AtomicBool;
    pub(crate) use ::core::sync::atomic::AtomicIsize;
    pub(crate) use ::core::sync::atomic::AtomicPtr;
    #[allow(unused_imports)]
    pub(crate) use ::core::sync::atomic::AtomicU64;
    pub(crate) use ::core::sync::atomic::AtomicUsize;
    pub(crate) use ::core::sync::atomic::Ordering;
    pub(crate) use ::core::sync::atomic::fence;
  }

  pub(crate) use ::std::sync::Mutex;
  #[allow(unused_imports)]
  pub(crate) use ::std::thread::yield_now;
}

#[cfg(loom)]
mod exports {
  pub(crate) mod atomic {
    pub(crate) use ::loom::sync::atomic::AtomicBool;
    pub(crate) use ::loom::sync::atomic::AtomicIsize;
    pub(crate) use ::loom::sync::atomic::AtomicPtr;
    pub(crate) use ::loom::sync::atomic::AtomicU64;
    pub(crate) use ::loom::sync::atomic::AtomicUsize;
    pub(crate) use ::loom::sync::atomic::Ordering;
    pub(crate) use ::loom::sync::atomic::fence;
  }

  pub(crate) use ::loom::sync::Mutex;
  pub(crate) use ::loom::thread::yield_now;
}

#[cfg(shuttle)]
mod exports {
  pub(crate) mod atomic {
    macro_rules! boxed_atomic {
      ($name:ident, $inner:path, $value:ty) => {
        #[repr(transparent)]
        pub(crate) struct $name {
          inner: Box<$inner>,
        }

        impl $name {
          #[inline]
          pub(crate) fn new(value: $value) -> Self {
            Self {
              inner: Box::new(<$inner>::new(value)),
            }
          }
        }

        impl ::core::ops::Deref for $name {
          type Target = $inner;

          #[inline]
          fn deref(&self) -> &Self::Target {
            &self.inner
          }
        }
      };
    }

    boxed_atomic!(AtomicBool, ::shuttle::sync::atomic::AtomicBool, bool);
    boxed_atomic!(AtomicIsize, ::shuttle::sync::atomic::AtomicIsize, isize);
    boxed_atomic!(AtomicU64, ::shuttle::sync::atomic::AtomicU64, u64);
    boxed_atomic!(AtomicUsize, ::shuttle::sync::atomic::AtomicUsize, usize);

    #[repr(transparent)]
    pub(crate) struct AtomicPtr<T> {
      inner: Box<::shuttle::sync::atomic::AtomicPtr<T>>,
    }

    impl<T> AtomicPtr<T> {
      #[inline]
      pub(crate) fn new(value: *mut T) -> Self {
        Self {
          inner: Box::new(::shuttle::sync::atomic::AtomicPtr::new(value)),
        }
      }
    }

    impl<T> ::core::ops::Deref for AtomicPtr<T> {
      type Target = ::shuttle::sync::atomic::AtomicPtr<T>;

      #[inline]
      fn deref(&self) -> &Self::Target {
        &self.inner
      }
    }

    pub(crate) use ::shuttle::sync::atomic::Ordering;
    pub(crate) use ::shuttle::sync::atomic::fence;
  }

  pub(crate) use ::shuttle::sync::Mutex;
  pub(crate) use ::shuttle::thread::yield_now;
}

pub(crate) use self::exports::*;
