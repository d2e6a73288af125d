//! Shared error plumbing used across all palisade crates.
pub mod error;
pub use error::FromMessage;
