//! Bit-field helpers for packed status and flag bytes.
//!
//! All helpers are total over `u8`. Bit positions wrap modulo 8, so callers
//! iterating over a wider range never hit an overflowing shift.

/// Single-bit mask for `position`.
pub const fn bit(position: u8) -> u8 {
    1u8 << (position % 8)
}

/// Whether bit `position` of `value` is set.
pub const fn test_bit(value: u8, position: u8) -> bool {
    value & bit(position) != 0
}

/// `value` with bit `position` set.
pub const fn set_bit(value: u8, position: u8) -> u8 {
    value | bit(position)
}

/// `value` with bit `position` cleared.
pub const fn unset_bit(value: u8, position: u8) -> u8 {
    value & !bit(position)
}

/// `value` with bit `position` flipped.
pub const fn toggle_bit(value: u8, position: u8) -> u8 {
    value ^ bit(position)
}

/// `value` with bit `position` forced to `on`.
pub const fn modify_bit(value: u8, position: u8, on: bool) -> u8 {
    if on {
        set_bit(value, position)
    } else {
        unset_bit(value, position)
    }
}

/// Exchange the high and low nibbles.
///
/// Devices answer from the nibble-swapped form of the address they were
/// queried on, e.g. a request to `0x13` is answered from `0x31`.
pub const fn swap_nibbles(value: u8) -> u8 {
    value.rotate_left(4)
}
