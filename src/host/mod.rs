//! User-space side of the host1x driver: buffers, sync points, channels and
//! hardware context switching for the engines that need it.

pub mod channel;
pub mod config;
pub mod context;
pub mod fence;
pub mod hwctx;
pub mod memory;
pub mod module;
#[cfg(test)]
pub mod sim;
pub mod syncpt;
