//! Backend-agnostic re-exports of the allocation primitives used by
//! [`crate::array`]. Swapped out for the `loom` shims under model checking.

#[cfg(loom)]
mod exports {
  pub(crate) use ::loom::alloc::alloc;
  pub(crate) use ::loom::alloc::dealloc;
  pub(crate) use ::std::alloc::handle_alloc_error;
}

#[cfg(not(loom))]
mod exports {
  pub(crate) use ::std::alloc::alloc;
  pub(crate) use ::std::alloc::dealloc;
  pub(crate) use ::std::alloc::handle_alloc_error;
}

pub(crate) use self::exports::*;
