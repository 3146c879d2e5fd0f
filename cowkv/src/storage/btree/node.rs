//! B-tree node layout and structural edits.
//!
//! A node occupies one page with the following layout:
//!
//! ```text
//! | type: u16 | nkeys: u16 | pointers: nkeys * u64 | offsets: nkeys * u16 | entries |
//! ```
//!
//! Each entry is `| klen: u16 | vlen: u16 | key | value |`. The offset list
//! stores, for entries `1..=nkeys`, the end of the previous entry relative to
//! the start of the entry area; the offset of entry 0 is always zero. Leaf
//! nodes leave pointers zero, internal nodes leave values empty and store in
//! key `i` the first key reachable through child `i`.
//!
//! Nodes under construction may grow to two pages. `split` cuts them back
//! into one to three nodes of at most one page each.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::codec::{self, CodecError};
use crate::storage::page::{PAGE_SIZE, PageId, PageType};

/// Size of the `type` + `nkeys` header.
pub const HEADER_SIZE: usize = 4;

/// Size of the `klen` + `vlen` prefix of every entry.
const ENTRY_PREFIX_SIZE: usize = 4;

/// Pointer plus offset slot per key.
const SLOT_SIZE: usize = 8 + 2;

/// Working buffer for nodes that may temporarily exceed a page.
const BUILD_BUFFER_SIZE: usize = 2 * PAGE_SIZE;

/// Errors raised while decoding or editing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// A field lies outside the node buffer.
    Codec(CodecError),
    /// The type tag is not a B-tree node type.
    InvalidType(u16),
    /// An index past the last key was requested.
    IndexOutOfRange { index: u16, count: u16 },
    /// A lookup was made in a node with no keys.
    Empty,
    /// The search key sorts before the first key of the node.
    KeyBelowNode,
    /// A key or value is too long for the entry length fields.
    EntryTooLarge(usize),
    /// A node cannot be cut into pieces that fit a page.
    Unsplittable { count: u16, bytes: usize },
    /// A finished node does not fit in one page.
    Overflow(usize),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "malformed node: {e}"),
            Self::InvalidType(t) => write!(f, "invalid node type: {t}"),
            Self::IndexOutOfRange { index, count } => {
                write!(f, "index {index} out of range for node with {count} keys")
            }
            Self::Empty => write!(f, "node has no keys"),
            Self::KeyBelowNode => write!(f, "key sorts before the first key of the node"),
            Self::EntryTooLarge(len) => write!(f, "entry field of {len} bytes is too large"),
            Self::Unsplittable { count, bytes } => {
                write!(f, "cannot split node with {count} keys and {bytes} bytes")
            }
            Self::Overflow(bytes) => {
                write!(f, "node of {bytes} bytes exceeds page size {PAGE_SIZE}")
            }
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for NodeError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// A B-tree node over some byte buffer.
///
/// `Node<&[u8]>` is a zero-copy view of a stored page; `Node<Vec<u8>>` is an
/// owned node produced by the structural edits below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<B = Vec<u8>> {
    buf: B,
}

/// A borrowed view of a stored node.
pub type NodeRef<'a> = Node<&'a [u8]>;

impl<B: AsRef<[u8]>> Node<B> {
    pub const fn new(buf: B) -> Self {
        Self { buf }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// The node kind. Free-list pages are rejected.
    pub fn node_type(&self) -> Result<PageType, NodeError> {
        let raw = codec::read_u16(self.bytes(), 0)?;
        match PageType::try_from(raw) {
            Ok(ty @ (PageType::Internal | PageType::Leaf)) => Ok(ty),
            _ => Err(NodeError::InvalidType(raw)),
        }
    }

    pub fn key_count(&self) -> Result<u16, NodeError> {
        Ok(codec::read_u16(self.bytes(), 2)?)
    }

    fn check_index(&self, index: u16) -> Result<u16, NodeError> {
        let count = self.key_count()?;
        if index >= count {
            return Err(NodeError::IndexOutOfRange { index, count });
        }
        Ok(count)
    }

    /// Child pointer at `index`. Zero in leaves.
    pub fn ptr(&self, index: u16) -> Result<PageId, NodeError> {
        self.check_index(index)?;
        Ok(codec::read_u64(self.bytes(), ptr_pos(index))?)
    }

    /// Start of entry `index` relative to the entry area. Valid for
    /// `0..=nkeys`; `offset(nkeys)` is the size of the entry area.
    fn offset(&self, index: u16) -> Result<usize, NodeError> {
        if index == 0 {
            return Ok(0);
        }
        let count = self.key_count()?;
        if index > count {
            return Err(NodeError::IndexOutOfRange { index, count });
        }
        Ok(usize::from(codec::read_u16(
            self.bytes(),
            offset_pos(count, index),
        )?))
    }

    fn entry_pos(&self, index: u16) -> Result<usize, NodeError> {
        let count = self.key_count()?;
        Ok(HEADER_SIZE + SLOT_SIZE * usize::from(count) + self.offset(index)?)
    }

    pub fn key(&self, index: u16) -> Result<&[u8], NodeError> {
        self.check_index(index)?;
        let pos = self.entry_pos(index)?;
        let klen = usize::from(codec::read_u16(self.bytes(), pos)?);
        Ok(codec::slice(self.bytes(), pos + ENTRY_PREFIX_SIZE, klen)?)
    }

    pub fn value(&self, index: u16) -> Result<&[u8], NodeError> {
        self.check_index(index)?;
        let pos = self.entry_pos(index)?;
        let klen = usize::from(codec::read_u16(self.bytes(), pos)?);
        let vlen = usize::from(codec::read_u16(self.bytes(), pos + 2)?);
        Ok(codec::slice(
            self.bytes(),
            pos + ENTRY_PREFIX_SIZE + klen,
            vlen,
        )?)
    }

    /// Number of bytes the node occupies.
    pub fn encoded_len(&self) -> Result<usize, NodeError> {
        let count = self.key_count()?;
        self.entry_pos(count)
    }

    /// Index of the last key less than or equal to `key`.
    ///
    /// Every node reached during a descent starts with a key no greater than
    /// the search key, so a miss is reported as `KeyBelowNode`.
    pub fn lookup_le(&self, key: &[u8]) -> Result<u16, NodeError> {
        let count = self.key_count()?;
        if count == 0 {
            return Err(NodeError::Empty);
        }
        // first index whose key is greater than the search key
        let (mut lo, mut hi) = (0u16, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Greater => hi = mid,
                Ordering::Less | Ordering::Equal => lo = mid + 1,
            }
        }
        lo.checked_sub(1).ok_or(NodeError::KeyBelowNode)
    }

    /// Size of the node formed by the first `count` entries.
    fn prefix_len(&self, count: u16) -> Result<usize, NodeError> {
        Ok(HEADER_SIZE + SLOT_SIZE * usize::from(count) + self.offset(count)?)
    }

    /// Copy of this node with `key`/`value` inserted at `index`.
    pub fn with_inserted(&self, index: u16, key: &[u8], value: &[u8]) -> Result<Node, NodeError> {
        let count = self.key_count()?;
        let mut node = Node::builder(PageType::Leaf, count + 1);
        node.append_range(self, 0, 0, index)?;
        node.append_entry(index, 0, key, value)?;
        node.append_range(self, index + 1, index, count - index)?;
        Ok(node)
    }

    /// Copy of this node with the entry at `index` replaced.
    pub fn with_updated(&self, index: u16, key: &[u8], value: &[u8]) -> Result<Node, NodeError> {
        let count = self.check_index(index)?;
        let mut node = Node::builder(PageType::Leaf, count);
        node.append_range(self, 0, 0, index)?;
        node.append_entry(index, 0, key, value)?;
        node.append_range(self, index + 1, index + 1, count - index - 1)?;
        Ok(node)
    }

    /// Copy of this node without the entry at `index`.
    pub fn with_removed(&self, index: u16) -> Result<Node, NodeError> {
        let count = self.check_index(index)?;
        let mut node = Node::builder(self.node_type()?, count - 1);
        node.append_range(self, 0, 0, index)?;
        node.append_range(self, index, index + 1, count - index - 1)?;
        Ok(node)
    }

    /// Copy of this internal node with the child at `index` replaced by
    /// `children`, each given as its page and first key.
    pub fn with_children_replaced(
        &self,
        index: u16,
        children: &[(PageId, &[u8])],
    ) -> Result<Node, NodeError> {
        let count = self.check_index(index)?;
        let added = u16::try_from(children.len())
            .map_err(|_| NodeError::EntryTooLarge(children.len()))?;
        let mut node = Node::builder(PageType::Internal, count - 1 + added);
        node.append_range(self, 0, 0, index)?;
        for (i, (ptr, key)) in (index..).zip(children) {
            node.append_entry(i, *ptr, key, &[])?;
        }
        node.append_range(self, index + added, index + 1, count - index - 1)?;
        Ok(node)
    }

    /// Copy of this internal node with the children at `index` and
    /// `index + 1` replaced by the single child `ptr`.
    pub fn with_children_merged(
        &self,
        index: u16,
        ptr: PageId,
        key: &[u8],
    ) -> Result<Node, NodeError> {
        let count = self.check_index(index + 1)?;
        let mut node = Node::builder(PageType::Internal, count - 1);
        node.append_range(self, 0, 0, index)?;
        node.append_entry(index, ptr, key, &[])?;
        node.append_range(self, index + 1, index + 2, count - index - 2)?;
        Ok(node)
    }

    /// Concatenate two sibling nodes of the same kind.
    pub fn merged<R: AsRef<[u8]>>(&self, right: &Node<R>) -> Result<Node, NodeError> {
        let left_count = self.key_count()?;
        let right_count = right.key_count()?;
        let mut node = Node::builder(self.node_type()?, left_count + right_count);
        node.append_range(self, 0, 0, left_count)?;
        node.append_range(right, left_count, 0, right_count)?;
        Ok(node)
    }

    /// Cut the node in two so that the right half fits in a page.
    ///
    /// The left half may still be oversized; `split` handles that case.
    fn split_two(&self) -> Result<(Node, Node), NodeError> {
        let count = self.key_count()?;
        let bytes = self.encoded_len()?;
        let unsplittable = NodeError::Unsplittable { count, bytes };
        if count < 2 {
            return Err(unsplittable);
        }

        let mut left = count / 2;
        while self.prefix_len(left)? > PAGE_SIZE {
            left -= 1;
            if left == 0 {
                return Err(unsplittable);
            }
        }
        while bytes - self.prefix_len(left)? + HEADER_SIZE > PAGE_SIZE {
            left += 1;
            if left >= count {
                return Err(unsplittable);
            }
        }

        let ty = self.node_type()?;
        let mut left_node = Node::builder(ty, left);
        left_node.append_range(self, 0, 0, left)?;
        let mut right_node = Node::builder(ty, count - left);
        right_node.append_range(self, 0, left, count - left)?;
        Ok((left_node, right_node))
    }

    /// Copy the node into an owned buffer.
    pub fn to_owned_node(&self) -> Result<Node, NodeError> {
        let len = self.encoded_len()?;
        Ok(Node::new(codec::slice(self.bytes(), 0, len)?.to_vec()))
    }
}

impl<'a> Node<&'a [u8]> {
    /// Key and value at `index`, borrowed for the lifetime of the page.
    pub fn entry_at(&self, index: u16) -> Result<(&'a [u8], &'a [u8]), NodeError> {
        self.check_index(index)?;
        let pos = self.entry_pos(index)?;
        let buf: &'a [u8] = self.buf;
        let klen = usize::from(codec::read_u16(buf, pos)?);
        let vlen = usize::from(codec::read_u16(buf, pos + 2)?);
        let key = codec::slice(buf, pos + ENTRY_PREFIX_SIZE, klen)?;
        let value = codec::slice(buf, pos + ENTRY_PREFIX_SIZE + klen, vlen)?;
        Ok((key, value))
    }
}

impl Node<Vec<u8>> {
    /// Start an empty node of `count` keys in a two-page working buffer.
    fn builder(ty: PageType, count: u16) -> Self {
        let mut buf = vec![0u8; BUILD_BUFFER_SIZE];
        buf[0..2].copy_from_slice(&(ty as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&count.to_le_bytes());
        Self { buf }
    }

    /// Build a leaf from sorted entries.
    pub fn leaf(entries: &[(&[u8], &[u8])]) -> Result<Self, NodeError> {
        let count =
            u16::try_from(entries.len()).map_err(|_| NodeError::EntryTooLarge(entries.len()))?;
        let mut node = Self::builder(PageType::Leaf, count);
        for (i, (key, value)) in (0..).zip(entries) {
            node.append_entry(i, 0, key, value)?;
        }
        Ok(node)
    }

    /// Build an internal node from `(child, first key)` pairs.
    pub fn internal(children: &[(PageId, &[u8])]) -> Result<Self, NodeError> {
        let count =
            u16::try_from(children.len()).map_err(|_| NodeError::EntryTooLarge(children.len()))?;
        let mut node = Self::builder(PageType::Internal, count);
        for (i, (ptr, key)) in (0..).zip(children) {
            node.append_entry(i, *ptr, key, &[])?;
        }
        Ok(node)
    }

    /// Write the entry at `index`. Entries must be appended in index order.
    fn append_entry(
        &mut self,
        index: u16,
        ptr: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), NodeError> {
        let count = self.key_count()?;
        if index >= count {
            return Err(NodeError::IndexOutOfRange { index, count });
        }
        let klen = u16::try_from(key.len()).map_err(|_| NodeError::EntryTooLarge(key.len()))?;
        let vlen =
            u16::try_from(value.len()).map_err(|_| NodeError::EntryTooLarge(value.len()))?;

        codec::write_u64(&mut self.buf, ptr_pos(index), ptr)?;
        let start = self.offset(index)?;
        let pos = HEADER_SIZE + SLOT_SIZE * usize::from(count) + start;
        codec::write_u16(&mut self.buf, pos, klen)?;
        codec::write_u16(&mut self.buf, pos + 2, vlen)?;
        codec::write_bytes(&mut self.buf, pos + ENTRY_PREFIX_SIZE, key)?;
        codec::write_bytes(&mut self.buf, pos + ENTRY_PREFIX_SIZE + key.len(), value)?;

        let end = start + ENTRY_PREFIX_SIZE + key.len() + value.len();
        let end = u16::try_from(end).map_err(|_| NodeError::EntryTooLarge(end))?;
        codec::write_u16(&mut self.buf, offset_pos(count, index + 1), end)?;
        Ok(())
    }

    /// Copy `n` entries of `old` starting at `src` into positions starting at `dst`.
    fn append_range<R: AsRef<[u8]>>(
        &mut self,
        old: &Node<R>,
        dst: u16,
        src: u16,
        n: u16,
    ) -> Result<(), NodeError> {
        for i in 0..n {
            let from = src + i;
            self.append_entry(dst + i, old.ptr(from)?, old.key(from)?, old.value(from)?)?;
        }
        Ok(())
    }

    /// Cut an oversized node into one to three nodes that each fit a page.
    pub fn split(self) -> Result<Vec<Self>, NodeError> {
        if self.encoded_len()? <= PAGE_SIZE {
            return Ok(vec![self]);
        }
        let (left, right) = self.split_two()?;
        if left.encoded_len()? <= PAGE_SIZE {
            return Ok(vec![left, right]);
        }
        let (left_left, middle) = left.split_two()?;
        let bytes = left_left.encoded_len()?;
        if bytes > PAGE_SIZE {
            return Err(NodeError::Unsplittable {
                count: left.key_count()?,
                bytes,
            });
        }
        Ok(vec![left_left, middle, right])
    }

    /// Finish the node as exactly one page.
    pub fn into_page(mut self) -> Result<Vec<u8>, NodeError> {
        let len = self.encoded_len()?;
        if len > PAGE_SIZE {
            return Err(NodeError::Overflow(len));
        }
        self.buf.resize(PAGE_SIZE, 0);
        Ok(self.buf)
    }
}

const fn ptr_pos(index: u16) -> usize {
    HEADER_SIZE + 8 * index as usize
}

/// Position of the stored offset for entry `index` (`1..=count`).
const fn offset_pos(count: u16, index: u16) -> usize {
    HEADER_SIZE + 8 * count as usize + 2 * (index as usize - 1)
}
