//! Ordered traversal over a B-tree.
//!
//! A `Cursor` keeps the full root-to-leaf path of node views plus the
//! position inside each node. Moving past the last key of a leaf walks up
//! until some ancestor can advance and then back down the new subtree.
//! Views borrow the page source, so writes cannot happen while a cursor is
//! alive.

use crate::storage::btree::node::NodeRef;
use crate::storage::btree::tree::{BTreeError, MAX_HEIGHT};
use crate::storage::io::PageRead;
use crate::storage::page::{PageId, PageType};

/// How a key relates to a reference key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Strictly greater.
    Greater,
    /// Greater or equal.
    GreaterOrEqual,
    /// Strictly less.
    Less,
    /// Less or equal.
    LessOrEqual,
}

impl Comparator {
    /// Whether keys satisfying this comparator lie after the reference key.
    #[must_use]
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::Greater | Self::GreaterOrEqual)
    }

    /// Whether `key` relates to `reference` as this comparator requires.
    #[must_use]
    pub fn accepts(self, key: &[u8], reference: &[u8]) -> bool {
        match self {
            Self::Greater => key > reference,
            Self::GreaterOrEqual => key >= reference,
            Self::Less => key < reference,
            Self::LessOrEqual => key <= reference,
        }
    }
}

impl std::str::FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" | "gt" => Ok(Self::Greater),
            ">=" | "ge" => Ok(Self::GreaterOrEqual),
            "<" | "lt" => Ok(Self::Less),
            "<=" | "le" => Ok(Self::LessOrEqual),
            _ => Err(format!("unknown comparator '{s}'")),
        }
    }
}

/// A position in the key order of a tree.
pub struct Cursor<'a, T: ?Sized> {
    pages: &'a T,
    path: Vec<NodeRef<'a>>,
    positions: Vec<u16>,
    exhausted: bool,
}

impl<'a, T: PageRead + ?Sized> Cursor<'a, T> {
    const fn empty(pages: &'a T) -> Self {
        Self {
            pages,
            path: Vec::new(),
            positions: Vec::new(),
            exhausted: true,
        }
    }

    fn node(&self, id: PageId) -> Result<NodeRef<'a>, BTreeError> {
        let pages: &'a T = self.pages;
        Ok(NodeRef::new(pages.read_page(id)?))
    }

    /// Descend from `root`, choosing the position in each node with `pick`.
    fn descend(
        pages: &'a T,
        root: PageId,
        mut pick: impl FnMut(&NodeRef<'a>) -> Result<u16, BTreeError>,
    ) -> Result<Self, BTreeError> {
        let mut cursor = Self::empty(pages);
        if root == 0 {
            return Ok(cursor);
        }
        cursor.exhausted = false;
        let mut id = root;
        loop {
            if cursor.path.len() >= MAX_HEIGHT {
                return Err(BTreeError::TooDeep(MAX_HEIGHT));
            }
            let node = cursor.node(id)?;
            let position = pick(&node)?;
            let internal = node.node_type()? == PageType::Internal;
            if internal {
                id = node.ptr(position)?;
            }
            cursor.path.push(node);
            cursor.positions.push(position);
            if !internal {
                return Ok(cursor);
            }
        }
    }

    /// Position at the last key less than or equal to `key`.
    fn seek_le(pages: &'a T, root: PageId, key: &[u8]) -> Result<Self, BTreeError> {
        Self::descend(pages, root, |node| Ok(node.lookup_le(key)?))
    }

    /// Position at the key nearest to `key` that satisfies `cmp`.
    pub fn seek(
        pages: &'a T,
        root: PageId,
        key: &[u8],
        cmp: Comparator,
    ) -> Result<Self, BTreeError> {
        let mut cursor = Self::seek_le(pages, root, key)?;
        if cmp != Comparator::LessOrEqual {
            if let Some((current, _)) = cursor.raw_entry()? {
                // a forward seek never rests on the sentinel
                if (cmp.is_forward() && current.is_empty()) || !cmp.accepts(current, key) {
                    if cmp.is_forward() {
                        cursor.move_next()?;
                    } else {
                        cursor.move_prev()?;
                    }
                }
            }
        }
        Ok(cursor)
    }

    /// Position at the smallest key.
    pub fn first(pages: &'a T, root: PageId) -> Result<Self, BTreeError> {
        let mut cursor = Self::descend(pages, root, |_| Ok(0))?;
        // step over the sentinel
        if matches!(cursor.raw_entry()?, Some((key, _)) if key.is_empty()) {
            cursor.move_next()?;
        }
        Ok(cursor)
    }

    /// Position at the largest key.
    pub fn last(pages: &'a T, root: PageId) -> Result<Self, BTreeError> {
        Self::descend(pages, root, last_position)
    }

    /// The entry under the cursor, including the sentinel.
    fn raw_entry(&self) -> Result<Option<(&'a [u8], &'a [u8])>, BTreeError> {
        if self.exhausted {
            return Ok(None);
        }
        match (self.path.last(), self.positions.last()) {
            (Some(leaf), Some(&position)) => Ok(Some(leaf.entry_at(position)?)),
            _ => Ok(None),
        }
    }

    /// The key and value under the cursor, or `None` when the cursor is
    /// outside the key range.
    pub fn entry(&self) -> Result<Option<(&'a [u8], &'a [u8])>, BTreeError> {
        Ok(self.raw_entry()?.filter(|(key, _)| !key.is_empty()))
    }

    /// Whether the cursor is on a key. A page that fails to decode is an
    /// error, not an invalid position.
    pub fn valid(&self) -> Result<bool, BTreeError> {
        Ok(self.entry()?.is_some())
    }

    /// Move to the next key. Moving past the last key invalidates the cursor.
    pub fn move_next(&mut self) -> Result<(), BTreeError> {
        self.step(true)
    }

    /// Move to the previous key. Moving past the first key invalidates the
    /// cursor.
    pub fn move_prev(&mut self) -> Result<(), BTreeError> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Result<(), BTreeError> {
        if self.exhausted || self.path.is_empty() {
            return Ok(());
        }
        let leaf = self.path.len() - 1;
        if !self.step_level(leaf, forward)? {
            self.exhausted = true;
        } else if !forward && matches!(self.raw_entry()?, Some((key, _)) if key.is_empty()) {
            // stepping back onto the sentinel is stepping past the first key
            self.exhausted = true;
        }
        Ok(())
    }

    /// Move within `level`, borrowing from the parent level when the node
    /// runs out. Returns false, leaving the path untouched, at either end of
    /// the tree.
    fn step_level(&mut self, level: usize, forward: bool) -> Result<bool, BTreeError> {
        let position = self.positions[level];
        let count = self.path[level].key_count()?;
        if forward && position + 1 < count {
            self.positions[level] = position + 1;
        } else if !forward && position > 0 {
            self.positions[level] = position - 1;
        } else if level == 0 || !self.step_level(level - 1, forward)? {
            return Ok(false);
        }

        if level + 1 < self.path.len() {
            let child_id = self.path[level].ptr(self.positions[level])?;
            let child = self.node(child_id)?;
            let expected = if level + 2 == self.path.len() {
                PageType::Leaf
            } else {
                PageType::Internal
            };
            if child.node_type()? != expected {
                return Err(BTreeError::Corruption(format!(
                    "page {child_id} is not a {expected:?} node"
                )));
            }
            let start = if forward { 0 } else { last_position(&child)? };
            self.path[level + 1] = child;
            self.positions[level + 1] = start;
        }
        Ok(true)
    }
}

fn last_position(node: &NodeRef<'_>) -> Result<u16, BTreeError> {
    node.key_count()?
        .checked_sub(1)
        .ok_or_else(|| BTreeError::Corruption("empty node on cursor path".to_string()))
}

/// A bounded walk over a cursor, yielding borrowed key-value pairs.
///
/// Forward scans start from a `Greater`/`GreaterOrEqual` seek and stop at
/// the first key failing a `Less`/`LessOrEqual` end bound; backward scans
/// mirror this.
pub struct Scan<'a, T: ?Sized> {
    cursor: Cursor<'a, T>,
    forward: bool,
    end: Option<(Vec<u8>, Comparator)>,
    started: bool,
    done: bool,
}

impl<'a, T: PageRead + ?Sized> Scan<'a, T> {
    pub fn new(cursor: Cursor<'a, T>, start: Comparator, end: Option<(&[u8], Comparator)>) -> Self {
        Self {
            cursor,
            forward: start.is_forward(),
            end: end.map(|(key, cmp)| (key.to_vec(), cmp)),
            started: false,
            done: false,
        }
    }
}

impl<'a, T: PageRead + ?Sized> Iterator for Scan<'a, T> {
    type Item = Result<(&'a [u8], &'a [u8]), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.started {
            let moved = if self.forward {
                self.cursor.move_next()
            } else {
                self.cursor.move_prev()
            };
            if let Err(e) = moved {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.started = true;

        match self.cursor.entry() {
            Ok(Some((key, value))) => {
                if let Some((end, cmp)) = &self.end {
                    if !cmp.accepts(key, end) {
                        self.done = true;
                        return None;
                    }
                }
                Some(Ok((key, value)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
