//! Pure sector arithmetic for the block hypercalls.
//!
//! | Function              | Used by                          |
//! |-----------------------|----------------------------------|
//! | [`sector_offset`]     | `BlockModule::blkwrite/blkread`  |

/// Byte offset of a `len`-byte transfer starting at `sector`, or `None`
/// if the transfer does not fit the device.
///
/// # Properties
///
/// - `sector >= num_sectors` ⟹ `None`
/// - `sector * sector_size + len` overflowing ⟹ `None`
/// - `sector * sector_size + len > num_sectors * sector_size` ⟹ `None`
/// - otherwise `Some(sector * sector_size)`
pub fn sector_offset(sector: u64, len: u64, sector_size: u64, num_sectors: u64) -> Option<u64> {
    if sector >= num_sectors {
        return None;
    }
    let offset = sector.checked_mul(sector_size)?;
    let end = offset.checked_add(len)?;
    let capacity = num_sectors.checked_mul(sector_size)?;
    if end > capacity {
        return None;
    }

    debug_assert!(offset < capacity || len == 0 || sector_size == 0);
    debug_assert!(offset + len <= capacity, "sector_offset: range must fit the device");
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTOR: u64 = 512;

    #[test]
    fn first_and_last_sector() {
        assert_eq!(sector_offset(0, 512, SECTOR, 8), Some(0));
        assert_eq!(sector_offset(7, 512, SECTOR, 8), Some(7 * 512));
    }

    #[test]
    fn multi_sector_transfer_within_capacity() {
        assert_eq!(sector_offset(2, 6 * 512, SECTOR, 8), Some(1024));
        assert_eq!(sector_offset(2, 6 * 512 + 1, SECTOR, 8), None);
    }

    #[test]
    fn partial_sector_lengths_are_allowed() {
        assert_eq!(sector_offset(3, 11, SECTOR, 8), Some(1536));
    }

    #[test]
    fn sector_past_end_rejected() {
        assert_eq!(sector_offset(8, 0, SECTOR, 8), None);
        assert_eq!(sector_offset(u64::MAX, 1, SECTOR, 8), None);
    }

    #[test]
    fn overflowing_offset_rejected() {
        assert_eq!(sector_offset(u64::MAX / 2, 0, SECTOR, u64::MAX), None);
        assert_eq!(sector_offset(1, u64::MAX, SECTOR, u64::MAX / SECTOR), None);
    }

    #[test]
    fn empty_device_rejects_everything() {
        assert_eq!(sector_offset(0, 0, SECTOR, 0), None);
    }
}
