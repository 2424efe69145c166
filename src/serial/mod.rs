//! Tagged-chunk binary format.
//!
//! Every chunk is a 4-byte ASCII tag, a little-endian `u32` body length and
//! the body, which is either raw scalar bytes or further chunks. Readers skip
//! chunks they do not recognise, so new fields can be added without breaking
//! older files.

pub mod reader;
pub mod tag;
pub mod writer;

pub use reader::{required, Chunk, Dispatch};
pub use tag::Tag;
pub use writer::ChunkWriter;
