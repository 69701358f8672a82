//! Bytecode core: opcodes and the chunk container they live in.

pub mod chunk;
pub mod op;

pub use chunk::{Chunk, ChunkBuilder, ConstValue};
pub use op::OpCode;
