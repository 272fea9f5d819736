#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

use std::time::Duration;

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_NONE: u32 = 0;
const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn io(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_NONE, type_, nr, 0)
}

#[must_use]
pub const fn ior<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Kernel encoding of an infinite sync-point wait (`-1` as `s32`).
pub const NO_TIMEOUT: u32 = u32::MAX;

/// Returns the bit position of the `n`th (0-indexed) set bit of `bits`.
#[must_use]
pub const fn nth_set_bit(mut bits: u32, mut n: u32) -> Option<u32> {
    let mut i = 0;
    while bits != 0 {
        if bits & 1 != 0 {
            if n == 0 {
                return Some(i);
            }
            n -= 1;
        }
        bits >>= 1;
        i += 1;
    }
    None
}

/// Sequence-number comparison of two sync-point values.
///
/// `current` has reached `threshold` when their wrapping difference is
/// non-negative as a signed 32-bit integer, which stays correct across counter
/// wraparound as long as outstanding thresholds are within half the range.
#[must_use]
pub const fn syncpt_reached(current: u32, threshold: u32) -> bool {
    (current.wrapping_sub(threshold) as i32) >= 0
}

#[must_use]
pub const fn is_power_of_two(val: u32) -> bool {
    val != 0 && val & (val - 1) == 0
}

#[must_use]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// System page size.
#[must_use]
pub fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 { ret as usize } else { 4096 }
}

/// Converts an optional timeout into the millisecond value the control device expects.
#[must_use]
pub fn timeout_to_ms(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => NO_TIMEOUT,
        // Clamp below the "infinite" sentinel so a huge finite timeout stays finite.
        Some(t) => t.as_millis().min(u128::from(NO_TIMEOUT - 1)) as u32,
    }
}
