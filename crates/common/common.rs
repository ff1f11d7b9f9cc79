pub use bytes::Bytes;
pub use ethereum_types::*;

pub mod constants;
pub mod types;
