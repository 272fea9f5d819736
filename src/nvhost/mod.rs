//! Raw kernel interface: ioctl ABI, device node wrappers and sysfs readback.

pub mod device;
pub mod ioctl;
pub mod sysfs;
