//! Structural parser.
//!
//! Consumes classified lines and builds the node arena for whichever block is
//! receiving content. Each content block keeps its own stack of open scopes,
//! so blocks may nest and interleave without disturbing each other.
//!
//! Scope rules:
//! - a scope closes when a later line is indented no deeper than the line
//!   that opened it
//! - a section (`@`) also accepts `:`, `,`, `-` and `&` lines at its own
//!   indent, so section bodies may be written flat
//! - the first child of a scope fixes the indent of all its siblings
//!
//! Hints naming a base type are cast as soon as the line is read. Any other
//! hint waits for the end of the stream, when every `types` block has been
//! seen.

use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::io::Read;

use crate::access::{child_path, escape_segment};
use crate::block::{BlockKind, BlockManager, COMMENT};
use crate::document::{
    Document, Mapping, Node, NodeId, RefState, Reference, Row, Scalar, Sequence, Slot,
};
use crate::error::{BlockFault, Diagnostic, Error, ParseContext, Result, StructuralFault};
use crate::scanner::{
    classify, reference_target, split_fields, split_hint, split_pair, strip_comment, unescape,
    Control, Piece, ScanLine, Span,
};
use crate::source::LineReader;
use crate::types::{is_base_hint, Cast, RowCast, TypeRegistry};

/// Parse a whole stream into a document.
///
/// With `retain` unset, scalars keep their spans, type tags and errors but
/// not their values or raw text.
pub(crate) fn parse_source<R: Read>(
    source: R,
    ctx: &ParseContext,
    retain: bool,
    max_depth: usize,
) -> Result<Document> {
    let mut lines = LineReader::new(source);
    let mut parser = Parser::new(ctx.clone(), retain, max_depth);
    while let Some(line) = lines.next_line(ctx)? {
        parser.feed(&line.text, line.number, line.offset)?;
    }
    debug!("Read {} bytes", lines.offset());
    Ok(parser.finish())
}

/// An open scope inside a block.
#[derive(Debug, Clone)]
struct Frame {
    /// Indent of the line that opened the scope. Unused for the block root.
    indent: usize,
    /// `None` for the block root, which hangs off the block itself.
    container: Option<NodeId>,
    /// Indent shared by all child lines, fixed by the first of them.
    child_indent: Option<usize>,
    section: bool,
    path: String,
}

impl Frame {
    fn root(block: &str) -> Self {
        Self {
            indent: 0,
            container: None,
            child_indent: None,
            section: false,
            path: escape_segment(block).into_owned(),
        }
    }
}

/// A cast waiting for the final type registry.
#[derive(Debug)]
enum Deferred {
    Scalar {
        node: NodeId,
        hint: String,
        raw: String,
        path: String,
    },
    Row {
        node: NodeId,
        hint: String,
        fields: Vec<Option<String>>,
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Mapping,
    Sequence,
}

/// One field of a `,` row.
#[derive(Debug, Clone, Copy)]
enum RowField<'a> {
    Text(Piece<'a>),
    Reference(Piece<'a>, &'a str),
}

/// Split a row payload into fields. A hint on the first field is returned
/// separately; it names either a composed type for the whole row or the
/// type of that field.
fn row_fields(payload: Piece<'_>) -> (Option<&str>, Vec<RowField<'_>>) {
    let mut hint = None;
    let mut fields = Vec::new();
    for (i, piece) in split_fields(payload).into_iter().enumerate() {
        if let Some(target) = reference_target(piece.text) {
            fields.push(RowField::Reference(piece, target));
        } else if i == 0 {
            let (h, rest) = split_hint(piece);
            hint = h;
            fields.push(RowField::Text(rest));
        } else {
            fields.push(RowField::Text(piece));
        }
    }
    (hint, fields)
}

fn raw_fields<'a>(fields: &[RowField<'a>]) -> Vec<Option<&'a str>> {
    fields
        .iter()
        .map(|f| match f {
            RowField::Text(piece) => Some(piece.text),
            RowField::Reference(..) => None,
        })
        .collect()
}

/// Whether `text` is a `>` or `<` line.
fn is_block_line(text: &str) -> bool {
    text.trim_start().starts_with(['>', '<'])
}

/// Whether `text` is the `< id` line closing `id`.
fn closes(text: &str, id: &str) -> bool {
    text.trim_start()
        .strip_prefix('<')
        .is_some_and(|rest| rest.starts_with(' ') && strip_comment(rest) == id)
}

pub(crate) struct Parser {
    ctx: ParseContext,
    retain: bool,
    max_depth: usize,
    nodes: Vec<Node>,
    blocks: BlockManager,
    registry: TypeRegistry,
    frames: HashMap<String, Vec<Frame>>,
    deferred: Vec<Deferred>,
    references: Vec<(NodeId, String)>,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    pub fn new(ctx: ParseContext, retain: bool, max_depth: usize) -> Self {
        Self {
            ctx,
            retain,
            max_depth,
            nodes: Vec::new(),
            blocks: BlockManager::new(),
            registry: TypeRegistry::new(),
            frames: HashMap::new(),
            deferred: Vec::new(),
            references: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Process one line.
    pub fn feed(&mut self, text: &str, line_num: usize, offset: u64) -> Result<()> {
        match self.blocks.current_kind() {
            BlockKind::Comment => {
                if closes(text, COMMENT) {
                    let line = classify(text, line_num, offset, &self.ctx)?;
                    return self.close_block(&line);
                }
                return Ok(());
            }
            BlockKind::Types => return self.declare(text, line_num, offset),
            BlockKind::Main | BlockKind::Named => {}
        }

        let line = classify(text, line_num, offset, &self.ctx)?;
        match line.control {
            Control::Blank | Control::Comment => Ok(()),
            Control::Open => self.open_block(&line),
            Control::Close => self.close_block(&line),
            _ => self.structural(&line),
        }
    }

    /// Wrap up at end of stream: bind references to `main`, run deferred
    /// casts and report what is left unresolved.
    pub fn finish(mut self) -> Document {
        let (resolved, unclosed) = self.blocks.finish();
        for node in resolved {
            self.set_state(node, RefState::Resolved);
        }
        for block in unclosed {
            self.diagnose(Diagnostic::UnclosedBlock {
                id: block.id,
                line: block.opened_line,
            });
        }

        for deferred in std::mem::take(&mut self.deferred) {
            match deferred {
                Deferred::Scalar {
                    node,
                    hint,
                    raw,
                    path,
                } => {
                    let cast = self.registry.cast_scalar(Some(&hint), &raw);
                    self.apply_cast(node, cast, &path);
                }
                Deferred::Row {
                    node,
                    hint,
                    fields,
                    path,
                } => {
                    let raws: Vec<Option<&str>> = fields.iter().map(|f| f.as_deref()).collect();
                    let cast = self.registry.cast_row(Some(&hint), &raws);
                    self.apply_row(node, cast, &path);
                }
            }
        }

        for (node, path) in std::mem::take(&mut self.references) {
            if let Node::Reference(r) = &self.nodes[node] {
                if r.state == RefState::Unresolved {
                    let target = r.target.clone();
                    self.diagnose(Diagnostic::Unresolved { path, target });
                }
            }
        }

        debug!(
            "Finished parse: {} nodes, {} types, {} diagnostics",
            self.nodes.len(),
            self.registry.len(),
            self.diagnostics.len()
        );
        Document {
            nodes: self.nodes,
            blocks: self.blocks.into_blocks(),
            registry: self.registry,
            diagnostics: self.diagnostics,
        }
    }

    fn fault(&self, fault: StructuralFault, line: &ScanLine) -> Error {
        Error::structural(fault, &self.ctx, line.line_num, line.offset)
    }

    fn diagnose(&mut self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn set_state(&mut self, node: NodeId, state: RefState) {
        if let Node::Reference(r) = &mut self.nodes[node] {
            r.state = state;
        }
    }

    // Blocks

    fn block_id<'a>(&self, line: &ScanLine<'a>) -> Result<&'a str> {
        let id = line.payload.text;
        if id.is_empty() {
            return Err(self.fault(StructuralFault::MissingBlockId, line));
        }
        Ok(id)
    }

    fn open_block(&mut self, line: &ScanLine) -> Result<()> {
        let id = self.block_id(line)?;
        let unbound = self
            .blocks
            .open(id, line.span(), line.line_num)
            .map_err(|fault| Error::block(fault, &self.ctx, line.line_num, line.offset))?;
        for node in unbound {
            self.set_state(node, RefState::Unresolved);
        }
        if BlockKind::for_id(id).has_content() {
            self.frames.insert(id.to_string(), vec![Frame::root(id)]);
        }
        Ok(())
    }

    fn close_block(&mut self, line: &ScanLine) -> Result<()> {
        let id = self.block_id(line)?;
        let resolved = self
            .blocks
            .close(id, line.span())
            .map_err(|fault| Error::block(fault, &self.ctx, line.line_num, line.offset))?;
        for node in resolved {
            self.set_state(node, RefState::Resolved);
        }
        if BlockKind::for_id(id) != BlockKind::Main {
            self.frames.remove(id);
        }
        Ok(())
    }

    /// A line inside `> types`. Block lines keep their usual meaning.
    fn declare(&mut self, text: &str, line_num: usize, offset: u64) -> Result<()> {
        if is_block_line(text) {
            let line = classify(text, line_num, offset, &self.ctx)?;
            return match line.control {
                Control::Open => self.open_block(&line),
                _ => self.close_block(&line),
            };
        }
        let body = strip_comment(text);
        if body.is_empty() {
            return Ok(());
        }
        match self.registry.declare(body) {
            Ok(def) => {
                debug!("Declared type \"{}\" with {} fields", def.name, def.fields.len());
                Ok(())
            }
            Err(why) => Err(Error::structural(
                StructuralFault::TypeDeclaration(why),
                &self.ctx,
                line_num,
                offset,
            )),
        }
    }

    // Structure

    fn structural(&mut self, line: &ScanLine) -> Result<()> {
        let block = self.blocks.current().to_string();
        let mut frames = self
            .frames
            .remove(&block)
            .unwrap_or_else(|| vec![Frame::root(&block)]);
        let placed = self.place(&block, &mut frames, line);
        self.frames.insert(block, frames);
        placed
    }

    fn place(&mut self, block: &str, frames: &mut Vec<Frame>, line: &ScanLine) -> Result<()> {
        while let Some(top) = frames.last().filter(|_| frames.len() > 1) {
            let stays = line.indent > top.indent
                || (line.indent == top.indent && top.section && line.control.is_section_body());
            if stays {
                break;
            }
            frames.pop();
        }

        let top = frames.len() - 1;
        match frames[top].child_indent {
            None => frames[top].child_indent = Some(line.indent),
            Some(indent) if indent != line.indent => {
                return Err(self.fault(StructuralFault::Indentation, line));
            }
            Some(_) => {}
        }

        match line.control {
            Control::Pair => self.pair(block, frames, line)?,
            Control::Entry => {
                if !frames[top].section {
                    return Err(self.fault(StructuralFault::OutsideSection, line));
                }
                self.pair(block, frames, line)?;
            }
            Control::Section => self.section(block, frames, line)?,
            Control::Row => self.row(block, frames, line)?,
            Control::Item => self.item(block, frames, line)?,
            Control::Reference => self.bare_reference(block, frames, line)?,
            Control::Open | Control::Close | Control::Comment | Control::Blank => {}
        }

        let span = line.span();
        if let Some(root) = self.blocks.get(block).and_then(|b| b.root) {
            self.nodes[root].span_mut().cover(span);
        }
        for container in frames.iter().filter_map(|f| f.container) {
            self.nodes[container].span_mut().cover(span);
        }
        Ok(())
    }

    fn empty_mapping(line: &ScanLine, settled: bool) -> Node {
        Node::Mapping(Mapping {
            entries: IndexMap::new(),
            span: line.span(),
            comment: line.comment_owned(),
            settled,
        })
    }

    /// Container of the innermost scope, checked (or settled) to be of the
    /// wanted kind. The block root is created here on first use.
    fn ensure(
        &mut self,
        block: &str,
        frames: &[Frame],
        want: Want,
        line: &ScanLine,
    ) -> Result<NodeId> {
        let scoped = frames.last().and_then(|f| f.container);
        let container = match scoped.or_else(|| self.blocks.get(block).and_then(|b| b.root)) {
            Some(id) => id,
            None => {
                let node = match want {
                    Want::Mapping => Node::Mapping(Mapping {
                        entries: IndexMap::new(),
                        span: line.span(),
                        comment: None,
                        settled: true,
                    }),
                    Want::Sequence => Node::Sequence(Sequence {
                        items: Vec::new(),
                        span: line.span(),
                        comment: None,
                        row: None,
                    }),
                };
                let id = self.push(node);
                self.blocks.set_root(block, id);
                return Ok(id);
            }
        };

        let kind = match &mut self.nodes[container] {
            Node::Mapping(m) if !m.settled => {
                if want == Want::Mapping {
                    m.settled = true;
                }
                None
            }
            Node::Mapping(_) => Some(Want::Mapping),
            _ => Some(Want::Sequence),
        };
        match kind {
            None if want == Want::Sequence => {
                let (span, comment) = match &self.nodes[container] {
                    Node::Mapping(m) => (m.span, m.comment.clone()),
                    other => (other.span(), None),
                };
                self.nodes[container] = Node::Sequence(Sequence {
                    items: Vec::new(),
                    span,
                    comment,
                    row: None,
                });
                Ok(container)
            }
            None => Ok(container),
            Some(kind) if kind == want => Ok(container),
            Some(_) => {
                if scoped.is_none() && BlockKind::for_id(block) == BlockKind::Named {
                    let fault = BlockFault::MixedContent(block.to_string());
                    return Err(Error::block(fault, &self.ctx, line.line_num, line.offset));
                }
                Err(self.fault(
                    match want {
                        Want::Mapping => StructuralFault::MappingKindMismatch,
                        Want::Sequence => StructuralFault::SequenceKindMismatch,
                    },
                    line,
                ))
            }
        }
    }

    fn entries(&self, mapping: NodeId) -> Option<&IndexMap<String, NodeId>> {
        match &self.nodes[mapping] {
            Node::Mapping(m) => Some(&m.entries),
            _ => None,
        }
    }

    fn insert(&mut self, mapping: NodeId, key: String, node: NodeId) {
        if let Node::Mapping(m) = &mut self.nodes[mapping] {
            m.entries.insert(key, node);
        }
    }

    fn append(&mut self, sequence: NodeId, node: NodeId) {
        if let Node::Sequence(s) = &mut self.nodes[sequence] {
            s.items.push(node);
        }
    }

    fn next_index(&self, sequence: NodeId) -> usize {
        match &self.nodes[sequence] {
            Node::Sequence(s) => s.items.len(),
            _ => 0,
        }
    }

    /// `= key = value` and `: key = value`.
    fn pair(&mut self, block: &str, frames: &[Frame], line: &ScanLine) -> Result<()> {
        let (key, value) = split_pair(line.payload)
            .ok_or_else(|| self.fault(StructuralFault::MissingValue, line))?;
        let key = unescape(key.text);
        if key.is_empty() {
            return Err(self.fault(StructuralFault::EmptyKey, line));
        }
        let parent = self.ensure(block, frames, Want::Mapping, line)?;
        if self.entries(parent).is_some_and(|e| e.contains_key(&key)) {
            return Err(self.fault(StructuralFault::DuplicateKey(key), line));
        }
        let path = child_path(&frames[frames.len() - 1].path, &key);
        let node = self.value(value, line, path)?;
        self.insert(parent, key, node);
        Ok(())
    }

    /// `@ key` opens a section; a bare `@` makes the block root a section.
    fn section(&mut self, block: &str, frames: &mut Vec<Frame>, line: &ScanLine) -> Result<()> {
        if line.payload.is_empty() {
            if frames.len() > 1 {
                return Err(self.fault(StructuralFault::MisplacedRoot, line));
            }
            if self.blocks.get(block).and_then(|b| b.root).is_none() {
                let root = self.push(Self::empty_mapping(line, false));
                self.blocks.set_root(block, root);
            }
            frames[0].section = true;
            frames[0].child_indent = None;
            return Ok(());
        }

        if frames.len() > self.max_depth {
            return Err(self.fault(StructuralFault::DepthLimit(self.max_depth), line));
        }
        let key = unescape(line.payload.text);
        let parent = self.ensure(block, frames, Want::Mapping, line)?;
        let existing = self.entries(parent).and_then(|e| e.get(&key)).copied();
        let container = match existing {
            Some(id) if matches!(
                self.nodes[id],
                Node::Mapping(_) | Node::Sequence(Sequence { row: None, .. })
            ) =>
            {
                id
            }
            Some(_) => return Err(self.fault(StructuralFault::DuplicateKey(key), line)),
            None => {
                let id = self.push(Self::empty_mapping(line, false));
                self.insert(parent, key.clone(), id);
                id
            }
        };
        let path = child_path(&frames[frames.len() - 1].path, &key);
        frames.push(Frame {
            indent: line.indent,
            container: Some(container),
            child_indent: None,
            section: true,
            path,
        });
        Ok(())
    }

    /// `, f1, f2, ...`
    fn row(&mut self, block: &str, frames: &[Frame], line: &ScanLine) -> Result<()> {
        let parent = self.ensure(block, frames, Want::Sequence, line)?;
        let path = child_path(
            &frames[frames.len() - 1].path,
            &self.next_index(parent).to_string(),
        );
        let (hint, fields) = row_fields(line.payload);

        if let [RowField::Reference(piece, target)] = fields.as_slice() {
            let span = line.span_of(*piece);
            let node = self.reference(target, true, span, line.comment_owned(), line, path)?;
            self.append(parent, node);
            return Ok(());
        }

        let row = self.push(Node::Sequence(Sequence {
            items: Vec::with_capacity(fields.len()),
            span: line.span(),
            comment: line.comment_owned(),
            row: Some(Row::default()),
        }));
        for (i, field) in fields.iter().enumerate() {
            let node = match *field {
                RowField::Text(piece) => {
                    let hint = if i == 0 { hint } else { None };
                    self.new_scalar(piece, hint, line, Slot::Field(i), None)
                }
                RowField::Reference(piece, target) => {
                    let span = line.span_of(piece);
                    let field_path = child_path(&path, &i.to_string());
                    self.reference(target, false, span, None, line, field_path)?
                }
            };
            self.append(row, node);
        }

        let raws = raw_fields(&fields);
        match hint {
            Some(h) if !is_base_hint(h) => self.deferred.push(Deferred::Row {
                node: row,
                hint: h.to_string(),
                fields: raws.iter().map(|r| r.map(String::from)).collect(),
                path,
            }),
            _ => {
                let cast = self.registry.cast_row(hint, &raws);
                self.apply_row(row, cast, &path);
            }
        }
        self.append(parent, row);
        Ok(())
    }

    /// `- value`
    fn item(&mut self, block: &str, frames: &[Frame], line: &ScanLine) -> Result<()> {
        let parent = self.ensure(block, frames, Want::Sequence, line)?;
        let path = child_path(
            &frames[frames.len() - 1].path,
            &self.next_index(parent).to_string(),
        );
        let node = self.value(line.payload, line, path)?;
        self.append(parent, node);
        Ok(())
    }

    /// `& id` on a line of its own.
    fn bare_reference(&mut self, block: &str, frames: &[Frame], line: &ScanLine) -> Result<()> {
        let parent = self.ensure(block, frames, Want::Sequence, line)?;
        let path = child_path(
            &frames[frames.len() - 1].path,
            &self.next_index(parent).to_string(),
        );
        let span = Span::new(
            line.offset + line.indent as u64,
            line.span_of(line.payload).end,
        );
        let node = self.reference(line.payload.text, false, span, line.comment_owned(), line, path)?;
        self.append(parent, node);
        Ok(())
    }

    /// A value position: a reference or a scalar.
    fn value(&mut self, value: Piece, line: &ScanLine, path: String) -> Result<NodeId> {
        if let Some(target) = reference_target(value.text) {
            let span = line.span_of(value);
            return self.reference(target, false, span, line.comment_owned(), line, path);
        }
        let (hint, raw) = split_hint(value);
        let node = self.new_scalar(raw, hint, line, Slot::Value, line.comment_owned());
        match hint {
            Some(h) if !is_base_hint(h) => self.deferred.push(Deferred::Scalar {
                node,
                hint: h.to_string(),
                raw: raw.text.to_string(),
                path,
            }),
            _ => {
                let cast = self.registry.cast_scalar(hint, raw.text);
                self.apply_cast(node, cast, &path);
            }
        }
        Ok(node)
    }

    fn reference(
        &mut self,
        target: &str,
        in_row: bool,
        span: Span,
        comment: Option<String>,
        line: &ScanLine,
        path: String,
    ) -> Result<NodeId> {
        if target.is_empty() {
            return Err(self.fault(StructuralFault::MissingBlockId, line));
        }
        let node = self.push(Node::Reference(Reference {
            target: target.to_string(),
            in_row,
            state: RefState::Unresolved,
            span,
            comment,
        }));
        if self.blocks.add_reference(target, node) {
            self.set_state(node, RefState::Resolved);
        }
        self.references.push((node, path));
        Ok(node)
    }

    fn new_scalar(
        &mut self,
        raw: Piece,
        hint: Option<&str>,
        line: &ScanLine,
        slot: Slot,
        comment: Option<String>,
    ) -> NodeId {
        let scalar = Scalar {
            value: None,
            raw: self.retain.then(|| raw.text.to_string()),
            type_tag: hint.unwrap_or("string").to_string(),
            comment,
            span: line.span_of(raw),
            line: line.span(),
            line_num: line.line_num,
            slot,
            error: None,
        };
        self.push(Node::Scalar(scalar))
    }

    // Casts

    fn apply_cast(&mut self, node: NodeId, cast: Cast, path: &str) {
        let Cast {
            value,
            type_tag,
            error,
        } = cast;
        if let Some(error) = &error {
            self.diagnose(Diagnostic::Type {
                path: path.to_string(),
                error: error.clone(),
            });
        }
        let retain = self.retain;
        if let Node::Scalar(s) = &mut self.nodes[node] {
            if retain {
                s.value = Some(value);
            }
            s.type_tag = type_tag;
            s.error = error;
        }
    }

    fn apply_row(&mut self, row: NodeId, cast: RowCast, path: &str) {
        let RowCast {
            type_tag,
            error,
            fields,
        } = cast;
        if let Some(error) = &error {
            self.diagnose(Diagnostic::Type {
                path: path.to_string(),
                error: error.clone(),
            });
        }
        let items = match &mut self.nodes[row] {
            Node::Sequence(seq) => {
                seq.row = Some(Row { type_tag, error });
                seq.items.clone()
            }
            _ => return,
        };
        for (i, (item, cast)) in items.into_iter().zip(fields).enumerate() {
            if let Some(cast) = cast {
                self.apply_cast(item, cast, &child_path(path, &i.to_string()));
            }
        }
    }
}

/// A scalar read back from its source line.
#[derive(Debug, Clone)]
pub(crate) struct ScalarView {
    pub cast: Cast,
    pub raw: String,
    pub comment: Option<String>,
}

/// Re-read the scalar at `slot` from one source line, casting it the same
/// way the parser did.
pub(crate) fn reread(
    text: &str,
    line_num: usize,
    offset: u64,
    slot: Slot,
    registry: &TypeRegistry,
    ctx: &ParseContext,
) -> Result<Option<ScalarView>> {
    let line = classify(text, line_num, offset, ctx)?;
    let single = |value: Piece| {
        let (hint, raw) = split_hint(value);
        ScalarView {
            cast: registry.cast_scalar(hint, raw.text),
            raw: raw.text.to_string(),
            comment: line.comment_owned(),
        }
    };
    let view = match (line.control, slot) {
        (Control::Pair | Control::Entry, Slot::Value) => {
            split_pair(line.payload).map(|(_, value)| single(value))
        }
        (Control::Item, Slot::Value) => Some(single(line.payload)),
        (Control::Row, Slot::Field(i)) => {
            let (hint, fields) = row_fields(line.payload);
            match fields.get(i) {
                Some(RowField::Text(piece)) => registry
                    .cast_row(hint, &raw_fields(&fields))
                    .fields
                    .into_iter()
                    .nth(i)
                    .flatten()
                    .map(|cast| ScalarView {
                        cast,
                        raw: piece.text.to_string(),
                        comment: None,
                    }),
                _ => None,
            }
        }
        _ => None,
    };
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeErrorKind;
    use crate::value::Value;
    use std::io::Cursor;

    fn parse(src: &str) -> Result<Document> {
        parse_source(Cursor::new(src), &ParseContext::new(None), true, 64)
    }

    fn root<'a>(doc: &'a Document, block: &str) -> &'a Node {
        doc.node(doc.block(block).and_then(|b| b.root).unwrap())
    }

    fn scalar(doc: &Document, id: NodeId) -> &Scalar {
        match doc.node(id) {
            Node::Scalar(s) => s,
            other => panic!("expected scalar, got {:?}", other),
        }
    }

    fn fault(err: Error) -> StructuralFault {
        match err {
            Error::Structural { fault, .. } => fault,
            other => panic!("expected structural error, got {}", other),
        }
    }

    #[test]
    fn test_top_level_pairs() {
        let doc = parse("= version = 0.2\n= name = demo # the name\n").unwrap();
        let Node::Mapping(m) = root(&doc, "main") else {
            panic!("root is not a mapping");
        };
        let version = scalar(&doc, m.entries["version"]);
        assert_eq!(version.value, Some(Value::from("0.2")));
        assert_eq!(version.type_tag, "string");
        assert_eq!(version.span, Span::new(12, 15));
        let name = scalar(&doc, m.entries["name"]);
        assert_eq!(name.comment.as_deref(), Some("the name"));
        assert_eq!(name.raw.as_deref(), Some("demo"));
    }

    #[test]
    fn test_flat_and_indented_sections() {
        let src = "@ headers\n: H1 = Exclude\n@ nested\n  : a = 1\n  @ inner\n    - x\n= after = y\n";
        let doc = parse(src).unwrap();
        let Node::Mapping(m) = root(&doc, "main") else {
            panic!("root is not a mapping");
        };
        assert_eq!(
            m.entries.keys().collect::<Vec<_>>(),
            vec!["headers", "nested", "after"]
        );
        let Node::Mapping(nested) = doc.node(m.entries["nested"]) else {
            panic!("nested is not a mapping");
        };
        assert!(matches!(doc.node(nested.entries["inner"]), Node::Sequence(_)));
    }

    #[test]
    fn test_section_settles_as_sequence() {
        let doc = parse("@ segments\n, & id2\n- plain\n").unwrap();
        let Node::Mapping(m) = root(&doc, "main") else {
            panic!("root is not a mapping");
        };
        let Node::Sequence(seq) = doc.node(m.entries["segments"]) else {
            panic!("segments is not a sequence");
        };
        assert_eq!(seq.items.len(), 2);
        let Node::Reference(r) = doc.node(seq.items[0]) else {
            panic!("first item is not a reference");
        };
        assert!(r.in_row);
        assert_eq!(r.state, RefState::Unresolved);
        assert!(matches!(
            doc.diagnostics()[0],
            Diagnostic::Unresolved { ref path, .. } if path == "main/segments/0"
        ));
    }

    #[test]
    fn test_forward_reference_resolves_on_close() {
        let src = "@ segments\n, & id2\n> id2\n@\n, H1, mouse\n< id2\n";
        let doc = parse(src).unwrap();
        assert!(doc.diagnostics().is_empty());
        let Node::Sequence(root) = root(&doc, "id2") else {
            panic!("id2 root is not a sequence");
        };
        assert_eq!(root.items.len(), 1);
    }

    #[test]
    fn test_entry_outside_section() {
        assert_eq!(
            fault(parse(": a = 1\n").unwrap_err()),
            StructuralFault::OutsideSection
        );
    }

    #[test]
    fn test_kind_mismatch() {
        let err = parse("@ s\n: a = 1\n- x\n").unwrap_err();
        assert_eq!(fault(err), StructuralFault::SequenceKindMismatch);
        let err = parse("- x\n= a = 1\n").unwrap_err();
        assert_eq!(fault(err), StructuralFault::MappingKindMismatch);
    }

    #[test]
    fn test_mixed_named_block() {
        let err = parse("> b\n- x\n= a = 1\n< b\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Block {
                fault: BlockFault::MixedContent(_),
                line: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_indentation() {
        let err = parse("@ s\n  : a = 1\n : b = 2\n").unwrap_err();
        assert_eq!(err.line(), Some(3));
        assert_eq!(fault(err), StructuralFault::Indentation);
    }

    #[test]
    fn test_duplicate_key_and_reused_section() {
        let err = parse("= a = 1\n= a = 2\n").unwrap_err();
        assert_eq!(fault(err), StructuralFault::DuplicateKey("a".into()));
        let doc = parse("@ s\n: a = 1\n= x = y\n@ s\n: b = 2\n").unwrap();
        let Node::Mapping(m) = root(&doc, "main") else {
            panic!("root is not a mapping");
        };
        let Node::Mapping(s) = doc.node(m.entries["s"]) else {
            panic!("s is not a mapping");
        };
        assert_eq!(s.entries.len(), 2);
    }

    #[test]
    fn test_depth_limit() {
        let src = "@ a\n  @ b\n    @ c\n";
        let err = parse_source(Cursor::new(src), &ParseContext::new(None), true, 2).unwrap_err();
        assert_eq!(fault(err), StructuralFault::DepthLimit(2));
    }

    #[test]
    fn test_comment_and_types_blocks() {
        let src = "> comment\nnot = parsed\n< comment\n> types\n# shapes\n(point) = (int) (int)\n< types\n, (point) 1, 2\n";
        let doc = parse(src).unwrap();
        assert_eq!(doc.registry().len(), 1);
        let Node::Sequence(seq) = root(&doc, "main") else {
            panic!("root is not a sequence");
        };
        let Node::Sequence(row) = doc.node(seq.items[0]) else {
            panic!("row is not a sequence");
        };
        assert_eq!(row.row.as_ref().unwrap().type_tag.as_deref(), Some("point"));
        assert_eq!(scalar(&doc, row.items[1]).value, Some(Value::from(2i64)));
    }

    #[test]
    fn test_types_declared_after_use() {
        let src = "- (point) 1\n, (point) 1, x\n> types\n(point) = (int) (int)\n< types\n";
        let doc = parse(src).unwrap();
        let kinds: Vec<_> = doc
            .diagnostics()
            .iter()
            .map(|d| match d {
                Diagnostic::Type { path, error } => (path.clone(), error.kind),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("main/0".to_string(), TypeErrorKind::NotARow),
                ("main/1/1".to_string(), TypeErrorKind::Cast),
            ]
        );
    }

    #[test]
    fn test_bad_declaration() {
        let err = parse("> types\n(p) = (point)\n< types\n").unwrap_err();
        assert!(matches!(fault(err), StructuralFault::TypeDeclaration(_)));
    }

    #[test]
    fn test_block_lines_inside_types() {
        let err = parse("> types\n> types\n< types\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Block {
                fault: BlockFault::DuplicateOpenBlock(ref id),
                line: 2,
                ..
            } if id == "types"
        ));

        let err = parse("> types\n< a\n< types\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Block {
                fault: BlockFault::UnknownCloseId(_),
                ..
            }
        ));

        let doc = parse("> a\n- x\n> types\n(pair) = (int) (int)\n< a\n< types\n, (pair) 1, 2\n")
            .unwrap();
        assert!(doc.diagnostics().is_empty());
        assert!(!doc.block("a").unwrap().open);
        assert!(doc.registry().get("pair").is_some());
        let Node::Sequence(seq) = root(&doc, "main") else {
            panic!("root is not a sequence");
        };
        let Node::Sequence(row) = doc.node(seq.items[0]) else {
            panic!("row is not a sequence");
        };
        assert_eq!(scalar(&doc, row.items[1]).value, Some(Value::from(2i64)));
    }

    #[test]
    fn test_closed_blocks_drop_their_frames() {
        let mut parser = Parser::new(ParseContext::new(None), true, 64);
        for (i, text) in ["> a", "@ s", ": k = v", "< a", "= top = 1"].iter().enumerate() {
            parser.feed(text, i + 1, 0).unwrap();
        }
        assert!(!parser.frames.contains_key("a"));
        assert!(parser.frames.contains_key("main"));
        parser.feed("> a", 6, 0).unwrap();
        parser.feed(": k2 = w", 7, 0).unwrap_err();
        assert!(parser.frames.contains_key("a"));
    }

    #[test]
    fn test_misplaced_root_and_missing_id() {
        let err = parse("@ a\n  @\n").unwrap_err();
        assert_eq!(fault(err), StructuralFault::MisplacedRoot);
        assert_eq!(fault(parse(">\n").unwrap_err()), StructuralFault::MissingBlockId);
        assert_eq!(fault(parse("- &\n").unwrap_err()), StructuralFault::MissingBlockId);
    }

    #[test]
    fn test_unclosed_block_is_reported() {
        let doc = parse("> open\n- x\n").unwrap();
        assert_eq!(
            doc.diagnostics(),
            &[Diagnostic::UnclosedBlock {
                id: "open".into(),
                line: 1
            }]
        );
    }

    #[test]
    fn test_streaming_parse_drops_values() {
        let doc = parse_source(
            Cursor::new("- (int) 7\n"),
            &ParseContext::new(None),
            false,
            64,
        )
        .unwrap();
        let Node::Sequence(seq) = root(&doc, "main") else {
            panic!("root is not a sequence");
        };
        let s = scalar(&doc, seq.items[0]);
        assert!(s.value.is_none() && s.raw.is_none());
        assert_eq!(s.type_tag, "int");
    }

    #[test]
    fn test_reread_matches_parse() {
        let mut registry = TypeRegistry::new();
        registry.declare("(point) = (int) (int=0-9)").unwrap();
        let ctx = ParseContext::new(None);
        let view = reread(", (point) 1, 12", 1, 0, Slot::Field(1), &registry, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(view.raw, "12");
        assert!(view.cast.error.is_some());
        let view = reread(": k = (int) 5 # five", 1, 0, Slot::Value, &registry, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(view.cast.value, Value::from(5i64));
        assert_eq!(view.comment.as_deref(), Some("five"));
        assert!(reread("- & id", 1, 0, Slot::Field(0), &registry, &ctx)
            .unwrap()
            .is_none());
    }
}
