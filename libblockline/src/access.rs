//! Query surface.
//!
//! A [`Blockline`] handle wraps a seekable source. Loaded handles parse the
//! whole stream at open time and answer from the node tree. Streaming
//! handles must [`scan`](Blockline::scan) first; the scan keeps only a path
//! index, and each query re-reads the bounded byte range it needs.
//!
//! Paths are `block/key/key/index`. A `/` or `%` inside a key is written
//! `%2F` or `%25`.

use log::{debug, warn};
use std::borrow::Cow;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::document::Document;
use crate::error::{Diagnostic, Error, ParseContext, Result};
use crate::index::{PathIndex, Streamed};
use crate::parser::parse_source;
use crate::scanner::Span;
use crate::types::TypeError;
use crate::value::Value;

/// How a handle serves queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Index on [`Blockline::scan`], re-read values on demand.
    Streaming,
    /// Parse everything at open time.
    Loaded,
}

/// Options for [`Blockline::open_with`].
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    /// Source name shown in error messages.
    pub filename: Option<String>,
    /// Maximum section nesting depth.
    pub max_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Loaded,
            filename: None,
            max_depth: 64,
        }
    }
}

impl Options {
    pub fn streaming() -> Self {
        Self {
            mode: Mode::Streaming,
            ..Self::default()
        }
    }
}

/// Metadata selector for [`Blockline::get_as`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Introspect {
    Value,
    Type,
    Comment,
    Span,
    Raw,
}

/// Everything known about one path.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    /// Cast type, `mapping`, `sequence`, or a row's composed type.
    pub type_tag: String,
    pub comment: Option<String>,
    /// Byte range of the raw text, container or block.
    pub span: Span,
    /// Unprocessed source text. `None` for containers.
    pub raw: Option<String>,
    pub error: Option<TypeError>,
}

/// Path lookups shared by loaded documents and scanned indexes.
pub(crate) trait Store {
    fn has(&self, segments: &[&str]) -> Result<bool>;
    fn value(&self, segments: &[&str]) -> Result<Option<Value>>;
    fn meta(&self, segments: &[&str]) -> Result<Option<Meta>>;
}

/// Escape one path segment.
pub(crate) fn escape_segment(segment: &str) -> Cow<'_, str> {
    if segment.contains(['%', '/']) {
        Cow::Owned(segment.replace('%', "%25").replace('/', "%2F"))
    } else {
        Cow::Borrowed(segment)
    }
}

/// Append an escaped segment to a path.
pub(crate) fn child_path(parent: &str, segment: &str) -> String {
    format!("{}/{}", parent, escape_segment(segment))
}

fn unescape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3).unwrap_or("");
        match code {
            "2F" | "2f" => out.push('/'),
            "25" => out.push('%'),
            _ => {
                out.push('%');
                rest = &rest[pos + 1..];
                continue;
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    out
}

/// Split a query path into unescaped segments.
pub(crate) fn parse_path(path: &str) -> Result<Vec<String>> {
    let malformed = |why| Error::MalformedPath {
        path: path.to_string(),
        why,
    };
    if path.is_empty() {
        return Err(malformed("empty path"));
    }
    path.split('/')
        .map(|segment| {
            if segment.is_empty() {
                Err(malformed("empty segment"))
            } else {
                Ok(unescape_segment(segment))
            }
        })
        .collect()
}

enum State {
    Unscanned,
    Scanned(PathIndex),
    Loaded(Document),
}

/// A Blockline document handle.
pub struct Blockline<R> {
    source: Mutex<R>,
    ctx: ParseContext,
    options: Options,
    state: State,
}

impl<R: Read + Seek> Blockline<R> {
    /// Open a source. Loaded handles parse it right away.
    pub fn open(source: R, mode: Mode) -> Result<Self> {
        Self::open_with(
            source,
            Options {
                mode,
                ..Options::default()
            },
        )
    }

    pub fn open_with(source: R, options: Options) -> Result<Self> {
        let mut handle = Self {
            source: Mutex::new(source),
            ctx: ParseContext::new(options.filename.as_deref()),
            options,
            state: State::Unscanned,
        };
        if handle.options.mode == Mode::Loaded {
            let doc = handle.read_all(true)?;
            handle.state = State::Loaded(doc);
        }
        Ok(handle)
    }

    fn read_all(&mut self, retain: bool) -> Result<Document> {
        let source = self.source.get_mut().map_err(|_| Error::LockPoisoned)?;
        source.seek(SeekFrom::Start(0))?;
        parse_source(&mut *source, &self.ctx, retain, self.options.max_depth)
    }

    pub fn mode(&self) -> Mode {
        self.options.mode
    }

    /// Whether queries can be answered: loaded, or streaming and scanned.
    pub fn is_ready(&self) -> bool {
        !matches!(self.state, State::Unscanned)
    }

    /// Index the source in one forward pass.
    ///
    /// Only the first call on a streaming handle reads anything; later calls,
    /// and calls on loaded handles, return `Ok(())` untouched.
    pub fn scan(&mut self) -> Result<()> {
        if self.is_ready() {
            debug!("Scan skipped: handle already indexed");
            return Ok(());
        }
        let doc = self.read_all(false)?;
        let index = PathIndex::build(doc);
        debug!("Scanned {} paths", index.len());
        self.state = State::Scanned(index);
        Ok(())
    }

    fn lookup<T>(
        &self,
        path: &str,
        query: impl FnOnce(&dyn Store, &[&str]) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let segments = parse_path(path)?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        match &self.state {
            State::Unscanned => {
                warn!("Query for \"{}\" before scan", path);
                Ok(None)
            }
            State::Loaded(doc) => query(doc, &segments),
            State::Scanned(index) => {
                let streamed = Streamed {
                    index,
                    source: &self.source,
                    ctx: &self.ctx,
                };
                query(&streamed, &segments)
            }
        }
    }

    /// Value at `path`, or `None` when the path is absent, passes through an
    /// unresolved reference, or the handle has not been scanned.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        self.lookup(path, |store, segments| store.value(segments))
    }

    /// Value or one piece of metadata at `path`.
    ///
    /// A missing comment or the raw text of a container comes back as
    /// `Value::Null`; spans as `[start, end]`.
    pub fn get_as(&self, path: &str, introspect: Introspect) -> Result<Option<Value>> {
        if introspect == Introspect::Value {
            return self.get(path);
        }
        Ok(self.meta(path)?.map(|meta| match introspect {
            Introspect::Type => Value::String(meta.type_tag),
            Introspect::Comment => meta.comment.map(Value::String).unwrap_or(Value::Null),
            Introspect::Span => Value::Array(vec![
                Value::from(meta.span.start as i64),
                Value::from(meta.span.end as i64),
            ]),
            Introspect::Raw => meta.raw.map(Value::String).unwrap_or(Value::Null),
            Introspect::Value => Value::Null,
        }))
    }

    pub fn has(&self, path: &str) -> Result<bool> {
        Ok(self
            .lookup(path, |store, segments| store.has(segments).map(Some))?
            .unwrap_or(false))
    }

    /// Like [`get`](Self::get), but absence is an error.
    pub fn require(&self, path: &str) -> Result<Value> {
        if !self.is_ready() {
            return Err(Error::NotScanned);
        }
        self.get(path)?
            .ok_or_else(|| Error::MissingPath(path.to_string()))
    }

    pub fn meta(&self, path: &str) -> Result<Option<Meta>> {
        self.lookup(path, |store, segments| store.meta(segments))
    }

    /// Non-fatal findings from the parse or scan, in stream order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match &self.state {
            State::Unscanned => &[],
            State::Loaded(doc) => doc.diagnostics(),
            State::Scanned(index) => index.diagnostics(),
        }
    }

    /// The node tree of a loaded handle.
    pub fn document(&self) -> Option<&Document> {
        match &self.state {
            State::Loaded(doc) => Some(doc),
            _ => None,
        }
    }

    /// The path index of a scanned handle.
    pub fn index(&self) -> Option<&PathIndex> {
        match &self.state {
            State::Scanned(index) => Some(index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("main/a/0").unwrap(), vec!["main", "a", "0"]);
        assert_eq!(parse_path("main/a%2Fb%25").unwrap(), vec!["main", "a/b%"]);
        assert_eq!(parse_path("main/100%").unwrap(), vec!["main", "100%"]);
        assert!(matches!(
            parse_path(""),
            Err(Error::MalformedPath { why: "empty path", .. })
        ));
        assert!(matches!(
            parse_path("main//a"),
            Err(Error::MalformedPath { why: "empty segment", .. })
        ));
    }

    #[test]
    fn test_child_path_escapes() {
        assert_eq!(child_path("main", "a/b"), "main/a%2Fb");
        assert_eq!(child_path("main", "plain"), "main/plain");
    }

    #[test]
    fn test_query_before_scan() {
        let handle = Blockline::open(Cursor::new("= a = 1\n"), Mode::Streaming).unwrap();
        assert!(!handle.is_ready());
        assert_eq!(handle.get("main/a").unwrap(), None);
        assert!(!handle.has("main/a").unwrap());
        assert!(matches!(handle.require("main/a"), Err(Error::NotScanned)));
        assert!(handle.diagnostics().is_empty());
    }

    #[test]
    fn test_introspection() {
        let handle = Blockline::open(
            Cursor::new("@ s # section\n- (int) 1 # one\n"),
            Mode::Loaded,
        )
        .unwrap();
        let get = |path, what| handle.get_as(path, what).unwrap().unwrap();
        assert_eq!(get("main/s/0", Introspect::Type), Value::from("int"));
        assert_eq!(get("main/s/0", Introspect::Raw), Value::from("1"));
        assert_eq!(get("main/s/0", Introspect::Comment), Value::from("one"));
        assert_eq!(
            get("main/s/0", Introspect::Span),
            Value::Array(vec![Value::from(22i64), Value::from(23i64)])
        );
        assert_eq!(get("main/s", Introspect::Type), Value::from("sequence"));
        assert_eq!(get("main/s", Introspect::Comment), Value::from("section"));
        assert_eq!(get("main/s", Introspect::Raw), Value::Null);
        assert_eq!(get("main", Introspect::Comment), Value::Null);
    }

    #[test]
    fn test_require_missing() {
        let handle = Blockline::open(Cursor::new("= a = 1\n"), Mode::Loaded).unwrap();
        assert_eq!(handle.require("main/a").unwrap(), Value::from("1"));
        let err = handle.require("main/b").unwrap_err();
        assert_eq!(err.to_string(), "Missing path \"main/b\"");
    }
}
