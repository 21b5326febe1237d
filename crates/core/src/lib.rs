//! Primitives shared by every redline crate.
//!
//! This crate contains no runtime concerns (threads, HTTP, logging setup).

pub mod error;
pub mod level;
pub mod name;

pub use error::{CoreError, CoreResult};
pub use level::LogLevel;
pub use name::Slug;
