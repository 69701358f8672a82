//! Diagnostic accumulation for the compiler front end.
//!
//! Mirrors the accumulate-then-bail shape the teacher's driver layer used
//! for build diagnostics: a parse does not stop at the first syntax error,
//! it keeps going (skipping to a safe resynchronization point) so a single
//! compile can report every mistake at once.

use crate::error::{EmberError, SourceLoc};

#[derive(Debug, Clone)]
pub struct Diagnostics {
    errors: Vec<EmberError>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics { errors: Vec::new() }
    }

    pub fn push(&mut self, message: impl Into<String>, loc: SourceLoc) {
        self.errors.push(EmberError::syntax(message, Some(loc)));
    }

    /// Records an already-built error (e.g. one returned by a parser
    /// function via `?`) instead of constructing a fresh `Syntax` one.
    pub fn record(&mut self, err: EmberError) {
        self.errors.push(err);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the first diagnostic as the canonical `EmberError` for this
    /// compile, per spec §7 (a failed compile surfaces one `Syntax` error to
    /// its caller even though more may have been collected internally).
    pub fn bail_if_errors(self) -> Result<(), EmberError> {
        match self.errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
