//! An in-memory file tree that synchronizes itself to file providers, and a
//! content database remembering what was written where, so unchanged files
//! aren't written again.
mod errors;
mod pool;

pub mod content;
pub mod database;
pub mod path;
pub mod provider;
pub mod tree;

pub use content::ContentDescriptor;
pub use database::{ContentDatabase, DatabaseConfig};
pub use errors::Error;
pub use pool::SyncOptions;

#[cfg(test)]
use rstest_reuse;

#[cfg(test)]
mod fixtures;

#[cfg(test)]
mod tests;
