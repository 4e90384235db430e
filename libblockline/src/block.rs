//! Block and reference bookkeeping.
//!
//! Blocks are opened with `> id` and closed with `< id`. `main` is ambient:
//! content outside any explicit block lands there, and it only counts as
//! closed once the stream ends. A closed block may be reopened; its new
//! content appends to the same root.
//!
//! References are stored as target ids. A reference is bound once its target
//! has closed with some content, and unbound again if the target reopens.

use indexmap::IndexMap;
use log::debug;
use std::collections::HashMap;

use crate::document::NodeId;
use crate::error::BlockFault;
use crate::scanner::Span;

pub const MAIN: &str = "main";
pub const COMMENT: &str = "comment";
pub const TYPES: &str = "types";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Main,
    Named,
    /// Composed type declarations.
    Types,
    /// Discarded lines.
    Comment,
}

impl BlockKind {
    pub fn for_id(id: &str) -> Self {
        match id {
            MAIN => BlockKind::Main,
            COMMENT => BlockKind::Comment,
            TYPES => BlockKind::Types,
            _ => BlockKind::Named,
        }
    }

    /// Whether the block holds structural content.
    pub fn has_content(self) -> bool {
        matches!(self, BlockKind::Main | BlockKind::Named)
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    /// Content root, created by the first content line.
    pub root: Option<NodeId>,
    /// Explicitly open right now.
    pub open: bool,
    /// Start of the first `> id` line.
    pub first_open: Option<u64>,
    /// End of the latest `< id` line.
    pub last_close: Option<u64>,
    /// Line of the latest `> id`, for unclosed-block reports.
    pub opened_line: usize,
}

impl Block {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: BlockKind::for_id(id),
            root: None,
            open: false,
            first_open: None,
            last_close: None,
            opened_line: 0,
        }
    }
}

/// Tracks open blocks and the references waiting on them.
#[derive(Debug)]
pub struct BlockManager {
    blocks: IndexMap<String, Block>,
    /// Explicitly open blocks, innermost last.
    open: Vec<String>,
    /// References whose target has not closed with content yet.
    waiting: HashMap<String, Vec<NodeId>>,
    /// References bound to their target.
    bound: HashMap<String, Vec<NodeId>>,
}

impl Default for BlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockManager {
    pub fn new() -> Self {
        let mut blocks = IndexMap::new();
        blocks.insert(MAIN.to_string(), Block::new(MAIN));
        Self {
            blocks,
            open: Vec::new(),
            waiting: HashMap::new(),
            bound: HashMap::new(),
        }
    }

    /// Id of the block receiving content.
    pub fn current(&self) -> &str {
        self.open.last().map(String::as_str).unwrap_or(MAIN)
    }

    pub fn current_kind(&self) -> BlockKind {
        BlockKind::for_id(self.current())
    }

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn set_root(&mut self, id: &str, root: NodeId) {
        if let Some(block) = self.blocks.get_mut(id) {
            block.root = Some(root);
        }
    }

    /// Handle `> id`. Returns references that were bound to a previous
    /// incarnation of the block and are unresolved again.
    pub fn open(&mut self, id: &str, span: Span, line: usize) -> Result<Vec<NodeId>, BlockFault> {
        if self.open.iter().any(|o| o == id) {
            return Err(BlockFault::DuplicateOpenBlock(id.to_string()));
        }
        let block = self
            .blocks
            .entry(id.to_string())
            .or_insert_with(|| Block::new(id));
        let reopened = block.first_open.is_some();
        block.open = true;
        block.opened_line = line;
        block.first_open.get_or_insert(span.start);
        self.open.push(id.to_string());
        debug!(
            "{} block \"{}\" at line {}",
            if reopened { "Reopened" } else { "Opened" },
            id,
            line
        );

        let unbound = self.bound.remove(id).unwrap_or_default();
        if !unbound.is_empty() {
            self.waiting
                .entry(id.to_string())
                .or_default()
                .extend(unbound.iter().copied());
        }
        Ok(unbound)
    }

    /// Handle `< id`. Returns references that are resolved by this close.
    pub fn close(&mut self, id: &str, span: Span) -> Result<Vec<NodeId>, BlockFault> {
        let Some(pos) = self.open.iter().rposition(|o| o == id) else {
            return match self.blocks.get(id) {
                Some(block) if block.first_open.is_some() => {
                    Err(BlockFault::DuplicateClose(id.to_string()))
                }
                _ => Err(BlockFault::UnknownCloseId(id.to_string())),
            };
        };
        self.open.remove(pos);
        let block = &mut self.blocks[id];
        block.open = false;
        block.last_close = Some(span.end);
        debug!("Closed block \"{}\"", id);

        // Main stays ambient until the end of the stream.
        if block.kind == BlockKind::Main {
            return Ok(Vec::new());
        }
        Ok(self.bind(id))
    }

    /// Register a reference node. Returns `true` when it is resolved already.
    pub fn add_reference(&mut self, target: &str, node: NodeId) -> bool {
        let ready = self.blocks.get(target).is_some_and(|b| {
            b.kind == BlockKind::Named && !b.open && b.first_open.is_some() && b.root.is_some()
        });
        let list = if ready { &mut self.bound } else { &mut self.waiting };
        list.entry(target.to_string()).or_default().push(node);
        ready
    }

    fn bind(&mut self, id: &str) -> Vec<NodeId> {
        let has_root = self.blocks.get(id).is_some_and(|b| b.root.is_some());
        if !has_root {
            return Vec::new();
        }
        let resolved = self.waiting.remove(id).unwrap_or_default();
        self.bound
            .entry(id.to_string())
            .or_default()
            .extend(resolved.iter().copied());
        resolved
    }

    /// End of stream: close `main` and report blocks left open.
    /// Returns the references resolved by closing `main`.
    pub fn finish(&mut self) -> (Vec<NodeId>, Vec<Block>) {
        let resolved = self.bind(MAIN);
        let unclosed = self
            .open
            .iter()
            .filter_map(|id| self.blocks.get(id))
            .cloned()
            .collect();
        (resolved, unclosed)
    }

    pub fn into_blocks(self) -> IndexMap<String, Block> {
        self.blocks
    }
}
