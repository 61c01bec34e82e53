//! Typed buffers, element kinds and physical layouts.

pub mod buffer;
pub mod dtype;
pub mod layout;

pub use buffer::{Buffer, BufferData, Element, MemoryDesc};
pub use dtype::DType;
pub use layout::{Layout, WEIGHT_BLOCK};

#[cfg(test)]
mod tests;
