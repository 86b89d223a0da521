//! # Skiff Platform
//!
//! Core platform types and capability traits for the Skiff SFTP client.
//!
//! This crate provides:
//! - Unified error types ([`SkiffError`], [`SkiffResult`])
//! - The transport boundary ([`SubsystemSession`], [`SubsystemStream`])
//! - Wire text handling ([`RemoteCharset`])
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{SkiffError, SkiffResult};
//!
//! fn example_function() -> SkiffResult<String> {
//!     Ok("Hello, Skiff!".to_string())
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Skiff!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{SkiffError, SkiffResult};
pub use traits::{RemoteCharset, SubsystemSession, SubsystemStream};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
