//! Lexer + single-pass recursive-descent compiler (spec §4.D).
//!
//! `compile_str` is the entry point the VM and embedding layers use; it
//! never touches the filesystem itself (file reading is the host's job, or
//! goes through `compile_file` below, which is a thin convenience wrapper).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod diagnostics;
pub mod lexer;
pub mod parser;

use std::path::Path;
use std::rc::Rc;

pub use diagnostics::Diagnostics;
pub use lexer::{InterpPart, Lexer, TokKind, Token};
pub use parser::Compiler;

use crate::bytecode::Chunk;
use crate::error::{EmberError, Result};

/// Compiles a source string into a top-level `Chunk`.
pub fn compile_str(source: &str, source_name: &str) -> Result<Rc<Chunk>> {
    Compiler::compile(source, source_name)
}

/// Reads `path` and compiles its contents, using the path as the
/// diagnostic source name.
pub fn compile_file(path: impl AsRef<Path>) -> Result<Rc<Chunk>> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .map_err(|e| EmberError::system(format!("cannot read '{}': {e}", path.display())))?;
    compile_str(&source, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_trivial_script() {
        let chunk = compile_str("let x = 1 + 2;", "<test>").unwrap();
        assert!(!chunk.code.is_empty());
    }
}
