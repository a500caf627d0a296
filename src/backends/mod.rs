//! Backend adapters behind the [`Backend`](crate::device::Backend) trait.
//!
//! The null backend lives in [`crate::device`]; this module holds adapters
//! with real dependencies.

#[cfg(feature = "cpal")]
mod cpal_backend;

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;
