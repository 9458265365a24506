//! PocketBank Common Types
//!
//! This crate contains shared types used across the PocketBank balance core,
//! including account identifiers, fixed-point money, transaction records and
//! the error kinds surfaced to callers.

pub mod identifiers;
pub mod monetary;
pub mod transaction;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
pub use error::*;
pub use time::*;
