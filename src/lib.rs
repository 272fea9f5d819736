pub mod error;
pub mod host;
pub mod nvhost;
pub mod utils;

pub use error::{HostError, HostResult};
pub use host::context::{Host, acquire, acquire_with, release};
