//! User database oracles

pub mod directory;

pub use directory::{InMemoryUserDirectory, UserDirectory};
