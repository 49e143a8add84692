//! Guest-physical range validation.
//!
//! | Function              | Used by                         |
//! |-----------------------|---------------------------------|
//! | [`check_range`]       | `GuestRam::check()`             |

use crate::memory::GpaError;

/// Largest single transfer a hypercall may request (`ssize_t` max).
pub const MAX_TRANSFER: u64 = isize::MAX as u64;

/// Check that `[gpa, gpa + len)` lies inside a guest memory of `mem_size`
/// bytes.
///
/// # Properties
///
/// - `Ok(())` implies `gpa + len` does not overflow and `gpa + len <= mem_size`
/// - `len > MAX_TRANSFER` is always rejected, whatever `mem_size` is
/// - A zero-length range at `gpa == mem_size` is accepted (it touches
///   nothing)
pub fn check_range(mem_size: u64, gpa: u64, len: u64) -> Result<(), GpaError> {
    if len > MAX_TRANSFER {
        return Err(GpaError::TooLarge { len });
    }
    let end = match gpa.checked_add(len) {
        Some(end) => end,
        None => return Err(GpaError::Overflow { gpa, len }),
    };
    if end > mem_size {
        return Err(GpaError::OutOfBounds { gpa, len, mem_size });
    }

    debug_assert!(
        gpa <= mem_size && len <= mem_size - gpa,
        "check_range: accepted range must be inside guest memory"
    );
    Ok(())
}
