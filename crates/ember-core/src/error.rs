//! Error taxonomy (spec §7) and the numeric `ErrorCode` table (spec §6).

use thiserror::Error;

/// A source location attached to a diagnostic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub line_text: String,
}

impl SourceLoc {
    pub fn new(file: impl Into<String>, line: u32, column: u32, line_text: impl Into<String>) -> Self {
        Self { file: file.into(), line, column, line_text: line_text.into() }
    }
}

/// One frame of a captured call-stack, used in uncaught-throw diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub function_name: String,
    pub line: u32,
}

/// Error/result-code table from spec §6. `#[repr(i32)]` so a future C ABI
/// shim can re-export it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Compile = -1,
    Runtime = -2,
    Type = -3,
    Memory = -4,
    Security = -5,
    System = -6,
    Internal = -7,
}

/// The seven-way error taxonomy of spec §7, each carrying a structured
/// diagnostic. Message text is capped at 512 chars by `EmberError::new`.
#[derive(Debug, Error, Clone)]
pub enum EmberError {
    #[error("{location:?}: syntax error: {message}")]
    Syntax { message: String, location: Option<SourceLoc> },

    #[error("runtime error: {message}")]
    Runtime { message: String, location: Option<SourceLoc>, call_stack: Vec<StackFrame> },

    #[error("type error: {message}")]
    Type { message: String, location: Option<SourceLoc>, call_stack: Vec<StackFrame> },

    #[error("memory error: {message}")]
    Memory { message: String },

    #[error("security error: {message}")]
    Security { message: String },

    #[error("import error: {message}")]
    Import { message: String, location: Option<SourceLoc> },

    #[error("system error: {message}")]
    System { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

const MAX_MESSAGE_LEN: usize = 512;

fn clamp_message(message: impl Into<String>) -> String {
    let mut m = message.into();
    if m.len() > MAX_MESSAGE_LEN {
        m.truncate(MAX_MESSAGE_LEN);
    }
    m
}

impl EmberError {
    pub fn syntax(message: impl Into<String>, location: Option<SourceLoc>) -> Self {
        EmberError::Syntax { message: clamp_message(message), location }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        EmberError::Runtime { message: clamp_message(message), location: None, call_stack: Vec::new() }
    }

    pub fn with_call_stack(mut self, stack: Vec<StackFrame>) -> Self {
        match &mut self {
            EmberError::Runtime { call_stack, .. } | EmberError::Type { call_stack, .. } => {
                *call_stack = stack;
            }
            _ => {}
        }
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        EmberError::Type { message: clamp_message(message), location: None, call_stack: Vec::new() }
    }

    pub fn memory(message: impl Into<String>) -> Self {
        EmberError::Memory { message: clamp_message(message) }
    }

    pub fn security(message: impl Into<String>) -> Self {
        EmberError::Security { message: clamp_message(message) }
    }

    pub fn import(message: impl Into<String>) -> Self {
        EmberError::Import { message: clamp_message(message), location: None }
    }

    pub fn system(message: impl Into<String>) -> Self {
        EmberError::System { message: clamp_message(message) }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EmberError::Internal { message: clamp_message(message) }
    }

    /// Maps this error onto the numeric code table of spec §6.
    pub fn code(&self) -> ErrorCode {
        match self {
            EmberError::Syntax { .. } => ErrorCode::Compile,
            EmberError::Runtime { .. } => ErrorCode::Runtime,
            EmberError::Type { .. } => ErrorCode::Type,
            EmberError::Memory { .. } => ErrorCode::Memory,
            EmberError::Security { .. } => ErrorCode::Security,
            EmberError::Import { .. } => ErrorCode::System,
            EmberError::System { .. } => ErrorCode::System,
            EmberError::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EmberError::Syntax { message, .. }
            | EmberError::Runtime { message, .. }
            | EmberError::Type { message, .. }
            | EmberError::Memory { message }
            | EmberError::Security { message }
            | EmberError::Import { message, .. }
            | EmberError::System { message }
            | EmberError::Internal { message } => message,
        }
    }

    /// Is this taxonomy catchable from user code via `try`/`catch`?
    ///
    /// Per spec §7: memory errors and call-stack overflow are not catchable;
    /// security errors never raise at all (they return nil/false instead);
    /// everything else unwinds through the exception subsystem.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, EmberError::Memory { .. })
    }
}

pub type Result<T, E = EmberError> = core::result::Result<T, E>;
