//! Copy-on-write B+tree over a page capability.
//!
//! The tree never modifies a page in place. Every write loads the nodes on
//! the path from the root, releases them, and allocates modified copies, so
//! the committed tree stays intact until the master record is replaced.
//!
//! The leftmost leaf always starts with an empty sentinel key so that every
//! lookup finds a key less than or equal to the search key. The sentinel is
//! never returned to callers. Root page 0 means the tree is empty.

use crate::storage::btree::cursor::{Comparator, Cursor};
use crate::storage::btree::node::{HEADER_SIZE, Node, NodeError, NodeRef};
use crate::storage::io::{PageAlloc, PageRead, StorageError};
use crate::storage::page::{PAGE_SIZE, PageId, PageType};

/// Descents deeper than this indicate a pointer cycle.
pub const MAX_HEIGHT: usize = 64;

/// Nodes at or below this size try to merge with a sibling after a delete.
const MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

/// A B-tree rooted at `root`, reading and writing through `pages`.
///
/// Construct it with `&pages` for reads and `&mut pages` for writes.
pub struct BTree<P> {
    pages: P,
    root: PageId,
}

/// Which sibling an underfull child merges with.
enum Merge {
    Left(Node),
    Right(Node),
    None,
}

impl<P: PageRead> BTree<P> {
    pub const fn new(pages: P, root: PageId) -> Self {
        Self { pages, root }
    }

    /// The current root page. Zero when the tree is empty.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    fn node(&self, id: PageId) -> Result<NodeRef<'_>, BTreeError> {
        Ok(NodeRef::new(self.pages.read_page(id)?))
    }

    fn load(&self, id: PageId) -> Result<Node, BTreeError> {
        Ok(self.node(id)?.to_owned_node()?)
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, BTreeError> {
        find(&self.pages, self.root, key)
    }

    /// Number of levels, counting the leaves. Zero for an empty tree.
    pub fn height(&self) -> Result<usize, BTreeError> {
        let mut height = 0;
        let mut id = self.root;
        while id != 0 {
            height += 1;
            if height > MAX_HEIGHT {
                return Err(BTreeError::TooDeep(MAX_HEIGHT));
            }
            let node = self.node(id)?;
            id = match node.node_type()? {
                PageType::Internal => node.ptr(0)?,
                _ => 0,
            };
        }
        Ok(height)
    }

    /// Number of stored keys, excluding the sentinel.
    pub fn count(&self) -> Result<u64, BTreeError> {
        let mut keys = 0u64;
        self.walk(self.root, 0, &mut |node| {
            if node.node_type()? == PageType::Leaf {
                keys += u64::from(node.key_count()?);
            }
            Ok(())
        })?;
        // the sentinel lives in the leftmost leaf of any non-empty tree
        Ok(keys.saturating_sub(1))
    }

    /// Every page referenced by the tree, in depth-first order.
    pub fn pages(&self) -> Result<Vec<PageId>, BTreeError> {
        let mut ids = Vec::new();
        if self.root != 0 {
            ids.push(self.root);
        }
        self.walk(self.root, 0, &mut |node| {
            if node.node_type()? == PageType::Internal {
                for i in 0..node.key_count()? {
                    ids.push(node.ptr(i)?);
                }
            }
            Ok(())
        })?;
        Ok(ids)
    }

    fn walk(
        &self,
        id: PageId,
        depth: usize,
        visit: &mut dyn FnMut(&NodeRef<'_>) -> Result<(), BTreeError>,
    ) -> Result<(), BTreeError> {
        if id == 0 {
            return Ok(());
        }
        if depth >= MAX_HEIGHT {
            return Err(BTreeError::TooDeep(MAX_HEIGHT));
        }
        let node = self.node(id)?;
        visit(&node)?;
        if node.node_type()? == PageType::Internal {
            for i in 0..node.key_count()? {
                self.walk(node.ptr(i)?, depth + 1, visit)?;
            }
        }
        Ok(())
    }
}

impl<'a, T: PageRead + ?Sized> BTree<&'a T> {
    /// Like `get`, but the value borrows from the page source instead of
    /// the tree handle.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<&'a [u8]>, BTreeError> {
        find(self.pages, self.root, key)
    }

    /// Position a cursor at the key closest to `key` that satisfies `cmp`.
    pub fn seek(&self, key: &[u8], cmp: Comparator) -> Result<Cursor<'a, T>, BTreeError> {
        Cursor::seek(self.pages, self.root, key, cmp)
    }

    /// Position a cursor at the smallest key.
    pub fn first(&self) -> Result<Cursor<'a, T>, BTreeError> {
        Cursor::first(self.pages, self.root)
    }
}

/// Descend from `root` to the leaf that would hold `key`.
fn find<'p, T: PageRead + ?Sized>(
    pages: &'p T,
    root: PageId,
    key: &[u8],
) -> Result<Option<&'p [u8]>, BTreeError> {
    if root == 0 || key.is_empty() {
        return Ok(None);
    }
    let mut node = NodeRef::new(pages.read_page(root)?);
    for _ in 0..MAX_HEIGHT {
        let index = node.lookup_le(key)?;
        if node.node_type()? == PageType::Internal {
            node = NodeRef::new(pages.read_page(node.ptr(index)?)?);
            continue;
        }
        let count = node.key_count()?;
        for i in [index, index + 1] {
            if i < count {
                let (found, value) = node.entry_at(i)?;
                if found == key {
                    return Ok(Some(value));
                }
            }
        }
        return Ok(None);
    }
    Err(BTreeError::TooDeep(MAX_HEIGHT))
}

impl<P: PageAlloc> BTree<P> {
    /// Insert `key` or replace its value.
    ///
    /// # Errors
    ///
    /// Returns `EmptyKey` for the reserved empty key. Size limits are the
    /// caller's responsibility; oversized entries fail with a node error.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
        if key.is_empty() {
            return Err(BTreeError::EmptyKey);
        }
        if self.root == 0 {
            let sentinel: &[u8] = &[];
            let leaf = Node::leaf(&[(sentinel, sentinel), (key, value)])?;
            self.root = self.pages.allocate(leaf.into_page()?)?;
            return Ok(());
        }

        let root = self.load(self.root)?;
        self.pages.release(self.root)?;
        let updated = self.insert_into(&root, key, value, 0)?;

        let children = self.allocate_split(updated)?;
        self.root = match children.as_slice() {
            [(only, _)] => *only,
            _ => {
                let refs: Vec<(PageId, &[u8])> = children
                    .iter()
                    .map(|(id, first)| (*id, first.as_slice()))
                    .collect();
                let root = Node::internal(&refs)?;
                self.pages.allocate(root.into_page()?)?
            }
        };
        Ok(())
    }

    fn insert_into(
        &mut self,
        node: &Node,
        key: &[u8],
        value: &[u8],
        depth: usize,
    ) -> Result<Node, BTreeError> {
        if depth >= MAX_HEIGHT {
            return Err(BTreeError::TooDeep(MAX_HEIGHT));
        }
        let index = node.lookup_le(key)?;
        match node.node_type()? {
            PageType::Internal => {
                let child_id = node.ptr(index)?;
                let child = self.load(child_id)?;
                self.pages.release(child_id)?;
                let updated = self.insert_into(&child, key, value, depth + 1)?;
                self.replace_child(node, index, updated)
            }
            _ if node.key(index)? == key => Ok(node.with_updated(index, key, value)?),
            _ => Ok(node.with_inserted(index + 1, key, value)?),
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, BTreeError> {
        if self.root == 0 || key.is_empty() {
            return Ok(false);
        }
        let root = self.load(self.root)?;
        let Some(updated) = self.delete_from(&root, key, 0)? else {
            return Ok(false);
        };
        self.pages.release(self.root)?;

        self.root = match (updated.node_type()?, updated.key_count()?) {
            (PageType::Internal, 1) => updated.ptr(0)?,
            (PageType::Internal, 0) => 0,
            (_, count) if count <= 1 => 0,
            _ => {
                let children = self.allocate_split(updated)?;
                match children.as_slice() {
                    [(only, _)] => *only,
                    _ => {
                        let refs: Vec<(PageId, &[u8])> = children
                            .iter()
                            .map(|(id, first)| (*id, first.as_slice()))
                            .collect();
                        let root = Node::internal(&refs)?;
                        self.pages.allocate(root.into_page()?)?
                    }
                }
            }
        };
        self.collapse_root()?;
        Ok(true)
    }

    fn delete_from(
        &mut self,
        node: &Node,
        key: &[u8],
        depth: usize,
    ) -> Result<Option<Node>, BTreeError> {
        if depth >= MAX_HEIGHT {
            return Err(BTreeError::TooDeep(MAX_HEIGHT));
        }
        let index = node.lookup_le(key)?;
        match node.node_type()? {
            PageType::Internal => self.delete_from_child(node, index, key, depth),
            _ if node.key(index)? == key => Ok(Some(node.with_removed(index)?)),
            _ => Ok(None),
        }
    }

    fn delete_from_child(
        &mut self,
        node: &Node,
        index: u16,
        key: &[u8],
        depth: usize,
    ) -> Result<Option<Node>, BTreeError> {
        let child_id = node.ptr(index)?;
        let child = self.load(child_id)?;
        let Some(updated) = self.delete_from(&child, key, depth + 1)? else {
            return Ok(None);
        };
        self.pages.release(child_id)?;

        let node = match self.merge_direction(node, index, &updated)? {
            Merge::Left(sibling) => {
                let merged = sibling.merged(&updated)?;
                self.pages.release(node.ptr(index - 1)?)?;
                let first = merged.key(0)?.to_vec();
                let id = self.pages.allocate(merged.into_page()?)?;
                node.with_children_merged(index - 1, id, &first)?
            }
            Merge::Right(sibling) => {
                let merged = updated.merged(&sibling)?;
                self.pages.release(node.ptr(index + 1)?)?;
                let first = merged.key(0)?.to_vec();
                let id = self.pages.allocate(merged.into_page()?)?;
                node.with_children_merged(index, id, &first)?
            }
            // an emptied child with no sibling to absorb it disappears
            Merge::None if updated.key_count()? == 0 => node.with_removed(index)?,
            Merge::None => self.replace_child(node, index, updated)?,
        };
        Ok(Some(node))
    }

    fn merge_direction(
        &self,
        parent: &Node,
        index: u16,
        updated: &Node,
    ) -> Result<Merge, BTreeError> {
        let size = updated.encoded_len()?;
        if size > MERGE_THRESHOLD {
            return Ok(Merge::None);
        }
        if index > 0 {
            let sibling = self.load(parent.ptr(index - 1)?)?;
            if sibling.encoded_len()? + size - HEADER_SIZE <= PAGE_SIZE {
                return Ok(Merge::Left(sibling));
            }
        }
        if index + 1 < parent.key_count()? {
            let sibling = self.load(parent.ptr(index + 1)?)?;
            if sibling.encoded_len()? + size - HEADER_SIZE <= PAGE_SIZE {
                return Ok(Merge::Right(sibling));
            }
        }
        Ok(Merge::None)
    }

    /// Split `updated` as needed, store the pieces, and splice them into
    /// `node` in place of the child at `index`.
    fn replace_child(
        &mut self,
        node: &Node,
        index: u16,
        updated: Node,
    ) -> Result<Node, BTreeError> {
        let children = self.allocate_split(updated)?;
        let refs: Vec<(PageId, &[u8])> = children
            .iter()
            .map(|(id, first)| (*id, first.as_slice()))
            .collect();
        Ok(node.with_children_replaced(index, &refs)?)
    }

    fn allocate_split(&mut self, node: Node) -> Result<Vec<(PageId, Vec<u8>)>, BTreeError> {
        let mut children = Vec::with_capacity(3);
        for piece in node.split()? {
            let first = piece.key(0)?.to_vec();
            let id = self.pages.allocate(piece.into_page()?)?;
            children.push((id, first));
        }
        Ok(children)
    }

    /// Drop root levels with a single child, and the root itself when only
    /// the sentinel remains.
    fn collapse_root(&mut self) -> Result<(), BTreeError> {
        for _ in 0..MAX_HEIGHT {
            if self.root == 0 {
                return Ok(());
            }
            let node = self.node(self.root)?;
            let next = match (node.node_type()?, node.key_count()?) {
                (PageType::Internal, 1) => node.ptr(0)?,
                (PageType::Internal, 0) => 0,
                (PageType::Internal, _) => return Ok(()),
                (_, count) if count <= 1 => 0,
                _ => return Ok(()),
            };
            self.pages.release(self.root)?;
            self.root = next;
        }
        Err(BTreeError::TooDeep(MAX_HEIGHT))
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Page access failed.
    Storage(StorageError),
    /// A node could not be decoded or edited.
    Node(NodeError),
    /// The empty key is reserved for the sentinel.
    EmptyKey,
    /// The tree is deeper than any valid tree could be.
    TooDeep(usize),
    /// The tree structure is inconsistent.
    Corruption(String),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::EmptyKey => write!(f, "the empty key is reserved"),
            Self::TooDeep(limit) => write!(f, "tree deeper than {limit} levels"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::storage::memory::MemoryPages;

    fn key(i: usize) -> Vec<u8> {
        format!("key{i:05}").into_bytes()
    }

    fn insert_all(pages: &mut MemoryPages, root: PageId, entries: &[(Vec<u8>, Vec<u8>)]) -> PageId {
        let mut tree = BTree::new(&mut *pages, root);
        for (k, v) in entries {
            tree.insert(k, v).expect("insert");
        }
        tree.root()
    }

    #[test]
    fn test_btree_basic_operations() {
        let mut pages = MemoryPages::new();
        let mut tree = BTree::new(&mut pages, 0);
        assert_eq!(tree.get(b"a").expect("get"), None);

        tree.insert(b"k1", b"hi").expect("insert 1");
        tree.insert(b"k3", b"hello").expect("insert 3");
        tree.insert(b"k2", b"b").expect("insert 2");

        assert_eq!(tree.get(b"k1").expect("get 1"), Some(&b"hi"[..]));
        assert_eq!(tree.get(b"k2").expect("get 2"), Some(&b"b"[..]));
        assert_eq!(tree.get(b"k3").expect("get 3"), Some(&b"hello"[..]));
        assert_eq!(tree.get(b"k4").expect("get 4"), None);
        assert_eq!(tree.get(b"").expect("get sentinel"), None);
        assert_eq!(tree.height().expect("height"), 1);
        assert_eq!(tree.count().expect("count"), 3);
    }

    #[test]
    fn test_btree_update() {
        let mut pages = MemoryPages::new();
        let mut tree = BTree::new(&mut pages, 0);
        tree.insert(b"key", b"original").expect("insert");
        tree.insert(b"key", b"updated").expect("update");
        assert_eq!(tree.get(b"key").expect("get"), Some(&b"updated"[..]));
        assert_eq!(tree.count().expect("count"), 1);
    }

    #[test]
    fn test_btree_rejects_empty_key() {
        let mut pages = MemoryPages::new();
        let mut tree = BTree::new(&mut pages, 0);
        assert!(matches!(tree.insert(b"", b"x"), Err(BTreeError::EmptyKey)));
        assert!(!tree.delete(b"").expect("delete"));
    }

    #[test]
    fn test_btree_remove() {
        let mut pages = MemoryPages::new();
        let mut tree = BTree::new(&mut pages, 0);
        tree.insert(b"a", b"1").expect("insert");
        tree.insert(b"b", b"2").expect("insert");

        assert!(tree.delete(b"a").expect("delete"));
        assert!(!tree.delete(b"a").expect("delete again"));
        assert!(!tree.delete(b"zz").expect("delete missing"));
        assert_eq!(tree.get(b"a").expect("get"), None);
        assert_eq!(tree.get(b"b").expect("get"), Some(&b"2"[..]));

        assert!(tree.delete(b"b").expect("delete last"));
        assert_eq!(tree.root(), 0);
        assert_eq!(pages.live_pages(), 0);
    }

    #[test]
    fn test_btree_delete_missing_key_leaves_tree_untouched() {
        let mut pages = MemoryPages::new();
        let value = vec![b'x'; 100];
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            (0..200).map(|i| (key(i * 2), value.clone())).collect();
        let root = insert_all(&mut pages, 0, &entries);
        pages.take_released();

        let tree = BTree::new(&pages, root);
        assert!(tree.height().expect("height") >= 2);
        let tree_pages = tree.pages().expect("pages");
        let (live, total) = (pages.live_pages(), pages.total_pages());

        let mut tree = BTree::new(&mut pages, root);
        // below, between and above the stored keys
        for missing in [b"a".to_vec(), key(101), key(999)] {
            assert!(!tree.delete(&missing).expect("delete missing"));
        }
        assert_eq!(tree.root(), root);
        assert_eq!(tree.pages().expect("pages"), tree_pages);
        assert_eq!(pages.live_pages(), live);
        assert_eq!(pages.total_pages(), total);
        assert!(pages.take_released().is_empty());
    }

    #[test]
    fn test_btree_lookup_borrows_from_pages() {
        let mut pages = MemoryPages::new();
        let root = insert_all(&mut pages, 0, &[(b"k".to_vec(), b"v".to_vec())]);
        let value = BTree::new(&pages, root).lookup(b"k").expect("lookup");
        assert_eq!(value, Some(&b"v"[..]));
        assert_eq!(BTree::new(&pages, root).lookup(b"j").expect("lookup"), None);
    }

    #[test]
    fn test_btree_many_inserts_split_and_shrink() {
        let mut pages = MemoryPages::new();
        let value = vec![b'x'; 100];
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200).map(|i| (key(i), value.clone())).collect();
        let root = insert_all(&mut pages, 0, &entries);

        let tree = BTree::new(&pages, root);
        assert!(tree.height().expect("height") >= 2);
        assert_eq!(tree.count().expect("count"), 200);
        for (k, v) in &entries {
            assert_eq!(tree.get(k).expect("get"), Some(v.as_slice()));
        }
        // every live page belongs to the tree
        assert_eq!(tree.pages().expect("pages").len(), pages.live_pages());

        let mut tree = BTree::new(&mut pages, root);
        for (k, _) in &entries {
            assert!(tree.delete(k).expect("delete"));
        }
        assert_eq!(tree.root(), 0);
        assert_eq!(tree.height().expect("height"), 0);
        assert_eq!(pages.live_pages(), 0);
    }

    #[test]
    fn test_btree_large_entries_split_three_ways() {
        let mut pages = MemoryPages::new();
        let mut tree = BTree::new(&mut pages, 0);
        let big = vec![b'v'; 3000];
        for letter in b'a'..b'u' {
            tree.insert(&[letter; 1000], &big).expect("insert large");
        }
        let small = (0..50).map(key).collect::<Vec<_>>();
        for k in &small {
            tree.insert(k, b"s").expect("insert small");
        }
        for k in &small {
            assert_eq!(tree.get(k).expect("get"), Some(&b"s"[..]));
        }
        let root = tree.root();
        let tree = BTree::new(&pages, root);
        for id in tree.pages().expect("pages") {
            let node = NodeRef::new(pages.read_page(id).expect("read"));
            assert!(node.encoded_len().expect("len") <= PAGE_SIZE);
        }
    }

    #[test]
    fn test_btree_matches_model_under_random_operations() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pages = MemoryPages::new();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut root = 0;

        for round in 0..2000u32 {
            let k = format!("k{:04}", rng.random_range(0..400)).into_bytes();
            let mut tree = BTree::new(&mut pages, root);
            if rng.random_bool(0.6) {
                let len = rng.random_range(0..300);
                let v = vec![round.to_le_bytes()[0]; len];
                tree.insert(&k, &v).expect("insert");
                model.insert(k, v);
            } else {
                let existed = tree.delete(&k).expect("delete");
                assert_eq!(existed, model.remove(&k).is_some());
            }
            root = tree.root();
        }

        let tree = BTree::new(&pages, root);
        assert_eq!(tree.count().expect("count"), model.len() as u64);
        for (k, v) in &model {
            assert_eq!(tree.get(k).expect("get"), Some(v.as_slice()));
        }
        assert_eq!(tree.pages().expect("pages").len(), pages.live_pages());

        let mut cursor = tree.first().expect("first");
        let mut seen = Vec::new();
        while let Some((k, _)) = cursor.entry().expect("entry") {
            seen.push(k.to_vec());
            cursor.move_next().expect("next");
        }
        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_btree_reads_do_not_copy_committed_pages() {
        let mut pages = MemoryPages::new();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..10).map(|i| (key(i), b"v".to_vec())).collect();
        let root = insert_all(&mut pages, 0, &entries);
        let before = pages.total_pages();
        let tree = BTree::new(&pages, root);
        assert!(tree.get(&key(3)).expect("get").is_some());
        assert_eq!(pages.total_pages(), before);
    }
}
