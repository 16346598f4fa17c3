//! In-memory storage implementation
//!
//! This module provides an in-memory entity store and the session backend
//! that reads and writes it. Suitable for development and testing.

mod store;

pub use store::{MemoryBackend, MemorySessionFactory, MemoryStore};
