//! Rendezvous Arenas
//!
//! Backing stores for the rendezvous engine: a stride arena that carves one
//! contiguous allocation into cache-line-spaced slots, and a chunked list
//! whose elements keep a stable address while the list grows.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod chunk;
pub mod stride;

pub use chunk::ChunkList;
pub use stride::StrideArena;
