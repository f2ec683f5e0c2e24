#[cfg(feature = "gateway")]
pub(crate) mod http;
#[cfg(feature = "gateway")]
pub(crate) mod task;
pub mod text;
