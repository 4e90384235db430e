//! Error types for Blockline parsing and queries.

use thiserror::Error;

use crate::types::TypeError;

/// Result type for Blockline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Parse context carrying the source name for error reporting.
#[derive(Clone, Debug, Default)]
pub struct ParseContext {
    pub filename: Option<String>,
}

impl ParseContext {
    /// Create a new parse context.
    pub fn new(filename: Option<&str>) -> Self {
        Self {
            filename: filename.map(String::from),
        }
    }

    /// Format a location suffix for error messages.
    pub fn loc_suffix(&self, line: usize, offset: u64) -> String {
        match &self.filename {
            Some(name) => format!(" at line {}, byte {} of <{}>", line, offset, name),
            None => format!(" at line {}, byte {}", line, offset),
        }
    }
}

/// Malformed line structure. Always fatal to the parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralFault {
    #[error("Unknown control character \"{0}\"")]
    BadControl(char),

    #[error("Expected space after \"{0}\"")]
    ExpectedSpaceAfter(char),

    #[error("Tab not allowed in indentation (use spaces)")]
    TabIndent,

    #[error("Unexpected indent")]
    Indentation,

    /// A key-value line landed in a sequence.
    #[error("Key-value line inside a sequence")]
    MappingKindMismatch,

    /// A list line landed in a mapping.
    #[error("List line inside a mapping")]
    SequenceKindMismatch,

    #[error("\":\" outside a section")]
    OutsideSection,

    #[error("\"@\" without a key is only allowed at the top of a block")]
    MisplacedRoot,

    #[error("Duplicate key \"{0}\"")]
    DuplicateKey(String),

    #[error("Empty key")]
    EmptyKey,

    #[error("Expected \"=\" after key")]
    MissingValue,

    #[error("Missing block id")]
    MissingBlockId,

    #[error("Section depth exceeds limit of {0}")]
    DepthLimit(usize),

    #[error("Invalid UTF-8")]
    InvalidUtf8,

    #[error("Bad type declaration: {0}")]
    TypeDeclaration(String),
}

/// Misuse of block open/close markers. Always fatal to the parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockFault {
    #[error("Block \"{0}\" is already open")]
    DuplicateOpenBlock(String),

    #[error("No open block \"{0}\" to close")]
    UnknownCloseId(String),

    #[error("Block \"{0}\" is already closed")]
    DuplicateClose(String),

    #[error("Block \"{0}\" mixes mapping and sequence content")]
    MixedContent(String),
}

/// Error type for Blockline operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{fault}{loc}")]
    Structural {
        fault: StructuralFault,
        line: usize,
        offset: u64,
        loc: String,
    },

    #[error("{fault}{loc}")]
    Block {
        fault: BlockFault,
        line: usize,
        offset: u64,
        loc: String,
    },

    /// Raised by `require` only.
    #[error("Missing path \"{0}\"")]
    MissingPath(String),

    #[error("Malformed path \"{path}\": {why}")]
    MalformedPath { path: String, why: &'static str },

    #[error("Document has not been scanned")]
    NotScanned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source lock was poisoned")]
    LockPoisoned,
}

impl Error {
    /// Create a structural error with location information.
    pub fn structural(fault: StructuralFault, ctx: &ParseContext, line: usize, offset: u64) -> Self {
        Error::Structural {
            fault,
            line,
            offset,
            loc: ctx.loc_suffix(line, offset),
        }
    }

    /// Create a block error with location information.
    pub fn block(fault: BlockFault, ctx: &ParseContext, line: usize, offset: u64) -> Self {
        Error::Block {
            fault,
            line,
            offset,
            loc: ctx.loc_suffix(line, offset),
        }
    }

    /// One-based line number of a parse error.
    pub fn line(&self) -> Option<usize> {
        match self {
            Error::Structural { line, .. } | Error::Block { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// Byte offset of the start of the offending line.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Error::Structural { offset, .. } | Error::Block { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

/// A non-fatal finding recorded while parsing or scanning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Diagnostic {
    #[error("{path}: {error}")]
    Type { path: String, error: TypeError },

    #[error("{path}: reference to \"{target}\" is unresolved")]
    Unresolved { path: String, target: String },

    #[error("Block \"{id}\" opened at line {line} was never closed")]
    UnclosedBlock { id: String, line: usize },
}
