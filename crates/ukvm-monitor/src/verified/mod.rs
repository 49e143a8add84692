//! Pure bounds arithmetic for the monitor.
//!
//! Everything that turns guest-controlled integers into host offsets is
//! computed here first, with no I/O and no access to guest memory.  The
//! imperative shell (`memory`, `devices`) only acts on ranges these
//! functions have accepted.
//!
//! Every function is total (never panics for any input), deterministic and
//! guarded by `debug_assert!` postconditions.

pub mod block;
pub mod gpa;
