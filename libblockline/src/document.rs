//! Document model: an arena of nodes plus the blocks that own them.
//!
//! Loaded handles answer queries straight from this tree. Streaming scans
//! build the same tree without scalar values and turn it into a
//! [`PathIndex`](crate::index::PathIndex).

use indexmap::IndexMap;

use crate::access::{Meta, Store};
use crate::block::Block;
use crate::error::{Diagnostic, Result};
use crate::scanner::Span;
use crate::types::{TypeError, TypeRegistry};
use crate::value::Value;

/// Index of a node in the document arena.
pub type NodeId = usize;

/// Where a scalar sits on its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The value of `=`, `:` or `-`.
    Value,
    /// Field `i` of a `,` row.
    Field(usize),
}

#[derive(Debug, Clone)]
pub struct Scalar {
    /// Cast value. `None` when parsed for a streaming scan.
    pub value: Option<Value>,
    /// Source text. `None` when parsed for a streaming scan.
    pub raw: Option<String>,
    pub type_tag: String,
    pub comment: Option<String>,
    /// Span of the raw text.
    pub span: Span,
    /// Span of the whole line, for re-reads.
    pub line: Span,
    /// One-based line number.
    pub line_num: usize,
    pub slot: Slot,
    pub error: Option<TypeError>,
}

#[derive(Debug, Clone)]
pub struct Mapping {
    pub entries: IndexMap<String, NodeId>,
    pub span: Span,
    pub comment: Option<String>,
    /// `false` until the first child line fixes the container kind.
    pub settled: bool,
}

#[derive(Debug, Clone)]
pub struct Sequence {
    pub items: Vec<NodeId>,
    pub span: Span,
    pub comment: Option<String>,
    /// Present when this sequence is a `,` tuple row.
    pub row: Option<Row>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Composed type applied to the row.
    pub type_tag: Option<String>,
    pub error: Option<TypeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    Resolved,
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct Reference {
    pub target: String,
    /// Sole field of a `,` row.
    pub in_row: bool,
    pub state: RefState,
    pub span: Span,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Scalar(Scalar),
    Mapping(Mapping),
    Sequence(Sequence),
    Reference(Reference),
}

impl Node {
    pub fn span(&self) -> Span {
        match self {
            Node::Scalar(s) => s.span,
            Node::Mapping(m) => m.span,
            Node::Sequence(s) => s.span,
            Node::Reference(r) => r.span,
        }
    }

    pub(crate) fn span_mut(&mut self) -> &mut Span {
        match self {
            Node::Scalar(s) => &mut s.span,
            Node::Mapping(m) => &mut m.span,
            Node::Sequence(s) => &mut s.span,
            Node::Reference(r) => &mut r.span,
        }
    }

    pub fn comment(&self) -> Option<&str> {
        match self {
            Node::Scalar(s) => s.comment.as_deref(),
            Node::Mapping(m) => m.comment.as_deref(),
            Node::Sequence(s) => s.comment.as_deref(),
            Node::Reference(r) => r.comment.as_deref(),
        }
    }

    /// Type tag reported for containers.
    pub(crate) fn container_tag(&self) -> &str {
        match self {
            Node::Mapping(_) => "mapping",
            Node::Sequence(Sequence {
                row: Some(Row {
                    type_tag: Some(tag),
                    ..
                }),
                ..
            }) => tag,
            Node::Sequence(_) => "sequence",
            Node::Scalar(s) => &s.type_tag,
            Node::Reference(_) => "reference",
        }
    }
}

/// A finished parse.
#[derive(Debug)]
pub struct Document {
    pub(crate) nodes: Vec<Node>,
    pub(crate) blocks: IndexMap<String, Block>,
    pub(crate) registry: TypeRegistry,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

/// Where a path landed.
enum Located {
    /// A bare block id: reports the block span.
    Block(NodeId, Span),
    Node(NodeId),
}

impl Document {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Extent of a block: from its first `>` (or first content line) to its
    /// last `<` (or last content line).
    pub fn block_span(&self, block: &Block) -> Span {
        let mut span = block
            .root
            .map(|root| self.nodes[root].span())
            .unwrap_or_default();
        if let Some(start) = block.first_open {
            if block.root.is_none() {
                span = Span::new(start, start);
            }
            span.start = span.start.min(start);
        }
        if let Some(end) = block.last_close {
            span.end = span.end.max(end);
        }
        span
    }

    /// Node a reference stands for: the target's content root, or its only
    /// row when the reference sits in row position.
    pub fn follow(&self, reference: &Reference) -> Option<NodeId> {
        if reference.state != RefState::Resolved {
            return None;
        }
        let root = self.blocks.get(&reference.target)?.root?;
        if reference.in_row {
            if let Node::Sequence(seq) = &self.nodes[root] {
                if let [only] = seq.items[..] {
                    if matches!(self.nodes[only], Node::Sequence(_)) {
                        return Some(only);
                    }
                }
            }
        }
        Some(root)
    }

    /// Step through a reference, recording the block it enters.
    fn deref(&self, id: NodeId, visiting: &mut Vec<String>) -> Option<NodeId> {
        match &self.nodes[id] {
            Node::Reference(r) => {
                let target = self.follow(r)?;
                visiting.push(r.target.clone());
                Some(target)
            }
            _ => Some(id),
        }
    }

    fn locate(&self, segments: &[&str], visiting: &mut Vec<String>) -> Option<Located> {
        let (first, rest) = segments.split_first()?;
        let block = self.blocks.get(*first)?;
        if !block.kind.has_content() {
            return None;
        }
        let root = block.root?;
        visiting.push(block.id.clone());
        if rest.is_empty() {
            return Some(Located::Block(root, self.block_span(block)));
        }

        let mut cur = root;
        for seg in rest {
            cur = self.deref(cur, visiting)?;
            cur = match &self.nodes[cur] {
                Node::Mapping(m) => *m.entries.get(*seg)?,
                Node::Sequence(s) => *s.items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        self.deref(cur, visiting).map(Located::Node)
    }

    fn materialize(&self, id: NodeId, visiting: &mut Vec<String>) -> Value {
        match &self.nodes[id] {
            Node::Scalar(s) => s.value.clone().unwrap_or(Value::Null),
            Node::Mapping(m) => Value::Object(
                m.entries
                    .iter()
                    .map(|(k, &child)| (k.clone(), self.materialize(child, visiting)))
                    .collect(),
            ),
            Node::Sequence(s) => Value::Array(
                s.items
                    .iter()
                    .map(|&child| self.materialize(child, visiting))
                    .collect(),
            ),
            Node::Reference(r) => match self.follow(r) {
                Some(target) if !visiting.contains(&r.target) => {
                    visiting.push(r.target.clone());
                    let value = self.materialize(target, visiting);
                    visiting.pop();
                    value
                }
                _ => Value::Reference(r.target.clone()),
            },
        }
    }

    fn node_meta(&self, id: NodeId, span: Span) -> Meta {
        match &self.nodes[id] {
            Node::Scalar(s) => Meta {
                type_tag: s.type_tag.clone(),
                comment: s.comment.clone(),
                span,
                raw: s.raw.clone(),
                error: s.error.clone(),
            },
            node => Meta {
                type_tag: node.container_tag().to_string(),
                comment: node.comment().map(String::from),
                span,
                raw: None,
                error: match node {
                    Node::Sequence(Sequence { row: Some(row), .. }) => row.error.clone(),
                    _ => None,
                },
            },
        }
    }
}

impl Store for Document {
    fn has(&self, segments: &[&str]) -> Result<bool> {
        Ok(self.locate(segments, &mut Vec::new()).is_some())
    }

    fn value(&self, segments: &[&str]) -> Result<Option<Value>> {
        let mut visiting = Vec::new();
        Ok(self.locate(segments, &mut visiting).map(|located| {
            let id = match located {
                Located::Block(id, _) | Located::Node(id) => id,
            };
            self.materialize(id, &mut visiting)
        }))
    }

    fn meta(&self, segments: &[&str]) -> Result<Option<Meta>> {
        Ok(
            self.locate(segments, &mut Vec::new())
                .map(|located| match located {
                    Located::Block(id, span) => self.node_meta(id, span),
                    Located::Node(id) => self.node_meta(id, self.nodes[id].span()),
                }),
        )
    }
}
