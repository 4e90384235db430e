//! Offset index.
//!
//! A scan parses the stream without keeping scalar values, then flattens the
//! node tree into a map from path to byte span. Scalars remember the line
//! they sit on; queries re-read that line, or the span of the container
//! being materialized, and cast it again with the final type registry.

use indexmap::IndexMap;
use log::trace;
use std::io::{Read, Seek};
use std::sync::Mutex;

use crate::access::{child_path, escape_segment, Meta, Store};
use crate::document::{Document, Node, NodeId, Row, Slot};
use crate::error::{Diagnostic, Error, ParseContext, Result, StructuralFault};
use crate::parser::reread;
use crate::scanner::Span;
use crate::source::Window;
use crate::types::TypeRegistry;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    Scalar {
        /// The whole source line.
        line: Span,
        line_num: usize,
        slot: Slot,
    },
    Mapping {
        keys: Vec<String>,
        comment: Option<String>,
    },
    Sequence {
        len: usize,
        comment: Option<String>,
        row: Option<Row>,
    },
    Reference {
        target: String,
        /// Path of the node the reference stands for, once resolved.
        follows: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub span: Span,
    pub kind: EntryKind,
}

/// Path-to-span map built by one scan.
#[derive(Debug, Default)]
pub struct PathIndex {
    entries: IndexMap<String, IndexEntry>,
    /// Content blocks with their full extent, keyed by escaped id.
    blocks: IndexMap<String, Span>,
    registry: TypeRegistry,
    diagnostics: Vec<Diagnostic>,
}

impl PathIndex {
    /// Flatten a parsed document. The node arena is dropped afterwards.
    pub fn build(doc: Document) -> Self {
        let mut index = PathIndex::default();
        for block in doc.blocks() {
            let Some(root) = block.root.filter(|_| block.kind.has_content()) else {
                continue;
            };
            let path = escape_segment(&block.id).into_owned();
            index.blocks.insert(path.clone(), doc.block_span(block));
            index.record(&doc, root, path);
        }
        index.registry = doc.registry;
        index.diagnostics = doc.diagnostics;
        index
    }

    fn record(&mut self, doc: &Document, id: NodeId, path: String) {
        let node = doc.node(id);
        let kind = match node {
            Node::Scalar(s) => EntryKind::Scalar {
                line: s.line,
                line_num: s.line_num,
                slot: s.slot,
            },
            Node::Mapping(m) => {
                for (key, &child) in &m.entries {
                    self.record(doc, child, child_path(&path, key));
                }
                EntryKind::Mapping {
                    keys: m.entries.keys().cloned().collect(),
                    comment: m.comment.clone(),
                }
            }
            Node::Sequence(s) => {
                for (i, &child) in s.items.iter().enumerate() {
                    self.record(doc, child, child_path(&path, &i.to_string()));
                }
                EntryKind::Sequence {
                    len: s.items.len(),
                    comment: s.comment.clone(),
                    row: s.row.clone(),
                }
            }
            Node::Reference(r) => {
                let follows = doc.follow(r).map(|target| {
                    let block_path = escape_segment(&r.target).into_owned();
                    let is_root = doc.block(&r.target).and_then(|b| b.root) == Some(target);
                    if is_root {
                        block_path
                    } else {
                        child_path(&block_path, "0")
                    }
                });
                EntryKind::Reference {
                    target: r.target.clone(),
                    follows,
                }
            }
        };
        self.entries.insert(
            path,
            IndexEntry {
                span: node.span(),
                kind,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    /// Every indexed path, in stream order per block.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn block_span(&self, id: &str) -> Option<Span> {
        self.blocks.get(escape_segment(id).as_ref()).copied()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    fn deref(&self, path: String, visiting: &mut Vec<String>) -> Option<String> {
        match &self.entries.get(&path)?.kind {
            EntryKind::Reference { target, follows } => {
                let follows = follows.clone()?;
                visiting.push(target.clone());
                Some(follows)
            }
            _ => Some(path),
        }
    }

    /// Resolve segments to an entry path and the span to report for it.
    fn locate(&self, segments: &[&str], visiting: &mut Vec<String>) -> Option<(String, Span)> {
        let (first, rest) = segments.split_first()?;
        let root = escape_segment(first).into_owned();
        let block_span = *self.blocks.get(&root)?;
        visiting.push(first.to_string());
        if rest.is_empty() {
            return Some((root, block_span));
        }

        let mut cur = root;
        for seg in rest {
            cur = self.deref(cur, visiting)?;
            cur = match &self.entries.get(&cur)?.kind {
                EntryKind::Mapping { keys, .. } if keys.iter().any(|k| k == seg) => {
                    child_path(&cur, seg)
                }
                EntryKind::Sequence { len, .. } => {
                    let i = seg.parse::<usize>().ok().filter(|i| i < len)?;
                    child_path(&cur, &i.to_string())
                }
                _ => return None,
            };
        }
        let cur = self.deref(cur, visiting)?;
        let span = self.entries.get(&cur)?.span;
        Some((cur, span))
    }
}

/// A scanned index together with the source it re-reads from.
pub(crate) struct Streamed<'a, R> {
    pub index: &'a PathIndex,
    pub source: &'a Mutex<R>,
    pub ctx: &'a ParseContext,
}

impl<R: Read + Seek> Streamed<'_, R> {
    fn window_for(&self, span: Span, current: Option<&Window>) -> Result<Option<Window>> {
        match current {
            Some(window) if window.covers(span) => Ok(None),
            _ => Window::read(self.source, span).map(Some),
        }
    }

    fn line_text<'w>(
        &self,
        window: &'w Window,
        line: Span,
        line_num: usize,
    ) -> Result<&'w str> {
        window.text(line).ok_or_else(|| {
            Error::structural(StructuralFault::InvalidUtf8, self.ctx, line_num, line.start)
        })
    }

    fn materialize(
        &self,
        path: &str,
        window: &Window,
        visiting: &mut Vec<String>,
    ) -> Result<Value> {
        let Some(entry) = self.index.entries.get(path) else {
            return Ok(Value::Null);
        };
        match &entry.kind {
            EntryKind::Scalar {
                line,
                line_num,
                slot,
            } => {
                let fresh = self.window_for(*line, Some(window))?;
                let window = fresh.as_ref().unwrap_or(window);
                let text = self.line_text(window, *line, *line_num)?;
                let view = reread(
                    text,
                    *line_num,
                    line.start,
                    *slot,
                    &self.index.registry,
                    self.ctx,
                )?;
                Ok(view.map(|v| v.cast.value).unwrap_or(Value::Null))
            }
            EntryKind::Mapping { keys, .. } => {
                let mut object = IndexMap::with_capacity(keys.len());
                for key in keys {
                    let value = self.materialize(&child_path(path, key), window, visiting)?;
                    object.insert(key.clone(), value);
                }
                Ok(Value::Object(object))
            }
            EntryKind::Sequence { len, .. } => (0..*len)
                .map(|i| self.materialize(&child_path(path, &i.to_string()), window, visiting))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            EntryKind::Reference { target, follows } => match follows {
                Some(follows) if !visiting.contains(target) => {
                    let Some(span) = self.index.entries.get(follows).map(|e| e.span) else {
                        return Ok(Value::Reference(target.clone()));
                    };
                    trace!("Following \"{}\" to {}", target, follows);
                    let fresh = self.window_for(span, Some(window))?;
                    let window = fresh.as_ref().unwrap_or(window);
                    visiting.push(target.clone());
                    let value = self.materialize(follows, window, visiting);
                    visiting.pop();
                    value
                }
                _ => Ok(Value::Reference(target.clone())),
            },
        }
    }
}

impl<R: Read + Seek> Store for Streamed<'_, R> {
    fn has(&self, segments: &[&str]) -> Result<bool> {
        Ok(self.index.locate(segments, &mut Vec::new()).is_some())
    }

    fn value(&self, segments: &[&str]) -> Result<Option<Value>> {
        let mut visiting = Vec::new();
        let Some((path, _)) = self.index.locate(segments, &mut visiting) else {
            return Ok(None);
        };
        // Scalars are re-read from their whole line.
        let span = match self.index.entries[&path] {
            IndexEntry {
                kind: EntryKind::Scalar { line, .. },
                ..
            } => line,
            IndexEntry { span, .. } => span,
        };
        let window = Window::read(self.source, span)?;
        self.materialize(&path, &window, &mut visiting).map(Some)
    }

    fn meta(&self, segments: &[&str]) -> Result<Option<Meta>> {
        let Some((path, span)) = self.index.locate(segments, &mut Vec::new()) else {
            return Ok(None);
        };
        let meta = match &self.index.entries[&path].kind {
            EntryKind::Scalar {
                line,
                line_num,
                slot,
            } => {
                let window = Window::read(self.source, *line)?;
                let text = self.line_text(&window, *line, *line_num)?;
                let view = reread(
                    text,
                    *line_num,
                    line.start,
                    *slot,
                    &self.index.registry,
                    self.ctx,
                )?;
                let Some(view) = view else {
                    return Ok(None);
                };
                Meta {
                    type_tag: view.cast.type_tag,
                    comment: view.comment,
                    span,
                    raw: Some(view.raw),
                    error: view.cast.error,
                }
            }
            EntryKind::Mapping { comment, .. } => Meta {
                type_tag: "mapping".to_string(),
                comment: comment.clone(),
                span,
                raw: None,
                error: None,
            },
            EntryKind::Sequence { comment, row, .. } => Meta {
                type_tag: row
                    .as_ref()
                    .and_then(|r| r.type_tag.clone())
                    .unwrap_or_else(|| "sequence".to_string()),
                comment: comment.clone(),
                span,
                raw: None,
                error: row.as_ref().and_then(|r| r.error.clone()),
            },
            EntryKind::Reference { .. } => Meta {
                type_tag: "reference".to_string(),
                comment: None,
                span,
                raw: None,
                error: None,
            },
        };
        Ok(Some(meta))
    }
}
