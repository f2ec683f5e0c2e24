mod error;
pub mod types;
pub mod utils;

#[cfg(feature = "gateway")]
pub mod gateway;

pub use error::{Error, Result};
pub use types::{Message, Role};
