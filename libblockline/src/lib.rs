//! Blockline parser implementation.
//!
//! Blockline is a line-oriented data format built for streaming. Every line
//! starts with a control character, documents are split into named blocks
//! that can be opened, closed and reopened, and values may refer forward to
//! blocks that appear later in the stream (or never).
//!
//! # Parsing Pipeline
//!
//! 1. **Scanner**: Classifies each line into indentation, control character,
//!    payload and inline comment, keeping byte offsets.
//!
//! 2. **Structural Parser**: Builds mapping, sequence, scalar and reference
//!    nodes under the block receiving content, with the block manager
//!    binding references as their targets close and the type engine casting
//!    hinted scalars.
//!
//! 3. **Access Layer**: Loaded handles query the node tree directly.
//!    Streaming handles flatten it into a path index during
//!    [`Blockline::scan`] and re-read bounded byte ranges per query.
//!
//! # Example
//!
//! ```
//! use libblockline::{parse, Introspect, Value};
//!
//! let doc = parse("= version = 0.2\n@ items\n- (int) 1\n").unwrap();
//! assert_eq!(doc.get("main/version").unwrap(), Some(Value::from("0.2")));
//! assert_eq!(doc.get("main/items/0").unwrap(), Some(Value::from(1i64)));
//! assert_eq!(
//!     doc.get_as("main/items/0", Introspect::Raw).unwrap(),
//!     Some(Value::from("1"))
//! );
//! ```

mod access;
mod block;
mod document;
mod error;
mod index;
mod parser;
mod scanner;
mod source;
mod types;
mod value;

use std::io::Cursor;

pub use access::{Blockline, Introspect, Meta, Mode, Options};
pub use block::{Block, BlockKind};
pub use document::{
    Document, Mapping, Node, NodeId, RefState, Reference, Row, Scalar, Sequence, Slot,
};
pub use error::{BlockFault, Diagnostic, Error, Result, StructuralFault};
pub use index::{EntryKind, IndexEntry, PathIndex};
pub use scanner::Span;
pub use types::{BaseType, Constraint, FieldSpec, TypeDef, TypeError, TypeErrorKind, TypeRegistry};
pub use value::Value;

/// Parse a Blockline document held in memory into a loaded handle.
pub fn parse(input: &str) -> Result<Blockline<Cursor<Vec<u8>>>> {
    parse_with_filename(input, None)
}

/// Parse a Blockline document with a filename for error messages.
pub fn parse_with_filename(
    input: &str,
    filename: Option<&str>,
) -> Result<Blockline<Cursor<Vec<u8>>>> {
    Blockline::open_with(
        Cursor::new(input.as_bytes().to_vec()),
        Options {
            filename: filename.map(String::from),
            ..Options::default()
        },
    )
}
