//! fixc-core: target parameters, arena allocation, and byte-buffer
//! primitives shared between the front end and the back end.
//!
//! # Modules
//!
//! - `target`: the fixed set of compilation targets (Windows/Linux x86-64,
//!   16-bit DOS) and the ABI-derived sizes that follow from each.
//! - `arena`: a bump allocator that hands out small `Copy` handles instead
//!   of owned pointers, used for the type table so a struct can reference
//!   its own type before its body is complete.
//! - `buffer`: little-endian byte-buffer helpers used by both the COFF and
//!   ELF object writers.

pub mod arena;
pub mod buffer;
pub mod target;

pub use arena::{Arena, ArenaId};
pub use buffer::ByteBuffer;
pub use target::{Bits, Os, Target};
