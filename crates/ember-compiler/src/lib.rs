//! ember-compiler — driver facade over `ember-core`'s lexer/parser/codegen.
//!
//! `ember-core::compiler` does the actual lexing/parsing/emission; this
//! crate is the thin, `anyhow`-flavored surface a CLI or build tool links
//! against instead of reaching into the engine directly, the same layering
//! the teacher workspace drew between its compiler driver and its core.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};

pub use ember_core::bytecode::Chunk;

/// Compiles a source string into a top-level [`Chunk`].
pub fn compile_str(source: &str, source_name: &str) -> Result<Rc<Chunk>> {
    ember_core::compiler::compile_str(source, source_name)
        .with_context(|| format!("compiling '{source_name}'"))
}

/// Reads and compiles a `.ember` source file.
pub fn compile_file(path: impl AsRef<Path>) -> Result<Rc<Chunk>> {
    let path = path.as_ref();
    ember_core::compiler::compile_file(path).with_context(|| format!("compiling '{}'", path.display()))
}

/// Alias of [`compile_file`] taking an owned `PathBuf`, for CLI argument
/// plumbing that already has one on hand.
pub fn compile_path(path: PathBuf) -> Result<Rc<Chunk>> {
    compile_file(path)
}

/// Renders a chunk's disassembly, e.g. for a `--dump-bytecode` CLI flag.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    chunk.disassemble(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_disassembles_a_trivial_script() {
        let chunk = compile_str("let x = 1 + 2;", "<test>").unwrap();
        let text = disassemble(&chunk, "<test>");
        assert!(text.contains("LOAD_CONST") || text.contains("ADD"));
    }
}
