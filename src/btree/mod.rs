//! B+ Tree secondary index over the record store
//!
//! The tree maps a composite key (vote count, record id) to the logical
//! address of a record. It supports:
//! - Duplicate vote counts (the record id breaks ties)
//! - Range queries (via doubly linked leaf nodes)
//! - Deletion with borrow/merge rebalancing and root collapse
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Nodes keep
//! no parent pointers; recursive operations pass the parent down as an
//! argument and report splits/merges back up through their return value.

mod error;
mod node;

pub use error::{BPlusTreeError, BPlusTreeResult};
pub use node::{BPlusNode, InternalNode, LeafEntry, LeafNode, NodeId};

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::access::AccessObserver;
use crate::record::{BLOCK_SIZE, ID_LEN, Record, RecordAddress};

/// Composite index key: vote count first, record id as tiebreaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub primary: i32,
    pub secondary: [u8; ID_LEN],
}

impl IndexKey {
    pub fn new(primary: i32, secondary: [u8; ID_LEN]) -> Self {
        Self { primary, secondary }
    }

    /// The smallest key with the given primary value
    pub fn lowest(primary: i32) -> Self {
        Self::new(primary, [0; ID_LEN])
    }

    /// Key of a record: (votes, id)
    pub fn from_record(record: &Record) -> BPlusTreeResult<Self> {
        let secondary = record
            .id_bytes()
            .map_err(|e| BPlusTreeError::InvalidKey(e.to_string()))?;
        Ok(Self::new(record.votes, secondary))
    }

    /// The record id part, without padding
    pub fn secondary_str(&self) -> String {
        let len = self
            .secondary
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ID_LEN);
        String::from_utf8_lossy(&self.secondary[..len]).into_owned()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.primary, self.secondary_str())
    }
}

/// Node header size assumed when sizing a node to a block
const NODE_HEADER_SIZE: usize = 8;
/// Serialized key size: i32 primary + fixed-width id
const KEY_SIZE: usize = 4 + ID_LEN;
/// Serialized child / record pointer size
const POINTER_SIZE: usize = 8;

/// Smallest supported order
pub const MIN_ORDER: usize = 3;

/// Order of a node sized to one default block
pub const DEFAULT_ORDER: usize = BPlusTree::max_order_for_block(BLOCK_SIZE);

/// Structural events since the tree was created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeEvents {
    pub leaf_splits: usize,
    pub internal_splits: usize,
    pub root_splits: usize,
    pub borrows: usize,
    pub merges: usize,
    pub root_collapses: usize,
}

/// A child split: the separator to insert in the parent and the new right node
struct Split {
    separator: IndexKey,
    node: NodeId,
}

/// Result of deleting one entry below some node
struct DeleteOutcome {
    found: bool,
    /// Index (in the parent) of a child that was merged away
    removed_child: Option<usize>,
}

impl DeleteOutcome {
    fn not_found() -> Self {
        Self {
            found: false,
            removed_child: None,
        }
    }

    fn found(removed_child: Option<usize>) -> Self {
        Self {
            found: true,
            removed_child,
        }
    }
}

/// B+ Tree data structure
///
/// Order `n` means:
/// - Leaf nodes hold at most `n` entries and (except root) at least `floor((n+1)/2)`
/// - Internal nodes hold at most `n` keys / `n+1` children and (except root)
///   at least `floor(n/2)+1` children
#[derive(Debug)]
pub struct BPlusTree {
    /// Root node ID (an empty leaf for an empty tree)
    root: NodeId,

    /// Tree order (max keys per node)
    order: usize,

    /// Node storage
    nodes: Vec<Option<BPlusNode>>,

    /// Free list for recycling deleted nodes
    free_list: Vec<NodeId>,

    /// Total number of entries in the tree
    entry_count: usize,

    events: TreeEvents,
}

impl BPlusTree {
    /// Create a new empty B+ tree with the given order
    ///
    /// # Arguments
    /// * `order` - The tree order (must be >= 3)
    ///
    /// # Returns
    /// * `Ok(BPlusTree)` - A new tree whose root is an empty leaf
    /// * `Err(BPlusTreeError)` - If order is invalid
    pub fn new(order: usize) -> BPlusTreeResult<Self> {
        if order < MIN_ORDER {
            return Err(BPlusTreeError::InvalidOrder(order));
        }

        Ok(Self {
            root: 0,
            order,
            nodes: vec![Some(BPlusNode::Leaf(LeafNode::new(order)))],
            free_list: Vec::new(),
            entry_count: 0,
            events: TreeEvents::default(),
        })
    }

    /// Largest order whose node still fits in one block of `block_size` bytes
    ///
    /// Never below [`MIN_ORDER`].
    pub const fn max_order_for_block(block_size: usize) -> usize {
        let available = block_size.saturating_sub(NODE_HEADER_SIZE + POINTER_SIZE);
        let order = available / (KEY_SIZE + POINTER_SIZE);
        if order < MIN_ORDER { MIN_ORDER } else { order }
    }

    /// Get the tree order
    pub fn order(&self) -> usize {
        self.order
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Get number of entries in the tree
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Get tree height (1 for a single leaf)
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut current = self.root;

        while let Some(BPlusNode::Internal(node)) = self.get_node(current) {
            match node.children.first() {
                Some(&child_id) => {
                    current = child_id;
                    height += 1;
                }
                None => break,
            }
        }

        height
    }

    /// Number of live nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free_list.len()
    }

    /// Get the root node ID
    pub fn root_node_id(&self) -> NodeId {
        self.root
    }

    /// Keys stored in the root node
    pub fn root_keys(&self) -> Vec<IndexKey> {
        self.node_keys(self.root)
    }

    /// Keys stored in a node (empty if the node does not exist)
    pub fn node_keys(&self, id: NodeId) -> Vec<IndexKey> {
        self.get_node(id)
            .map(|node| node.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Structural events since creation
    pub fn events(&self) -> TreeEvents {
        self.events
    }

    // ========== Node Management ==========

    /// Allocate a new node, returning its ID
    fn allocate_node(&mut self, node: BPlusNode) -> NodeId {
        if let Some(id) = self.free_list.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            let id = self.nodes.len();
            self.nodes.push(Some(node));
            id
        }
    }

    /// Remove a node from storage, returning its contents
    fn free_node(&mut self, id: NodeId) -> Option<BPlusNode> {
        let node = self.nodes.get_mut(id)?.take()?;
        self.free_list.push(id);
        Some(node)
    }

    /// Get a reference to a node by ID
    pub fn get_node(&self, id: NodeId) -> Option<&BPlusNode> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    fn node(&self, id: NodeId) -> BPlusTreeResult<&BPlusNode> {
        self.get_node(id).ok_or(BPlusTreeError::NodeNotFound(id))
    }

    fn leaf(&self, id: NodeId) -> BPlusTreeResult<&LeafNode> {
        self.node(id)?
            .as_leaf()
            .ok_or_else(|| BPlusTreeError::InvalidState(format!("node {id} is not a leaf")))
    }

    fn leaf_mut(&mut self, id: NodeId) -> BPlusTreeResult<&mut LeafNode> {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.as_mut())
            .ok_or(BPlusTreeError::NodeNotFound(id))?
            .as_leaf_mut()
            .ok_or_else(|| BPlusTreeError::InvalidState(format!("node {id} is not a leaf")))
    }

    fn internal(&self, id: NodeId) -> BPlusTreeResult<&InternalNode> {
        self.node(id)?
            .as_internal()
            .ok_or_else(|| BPlusTreeError::InvalidState(format!("node {id} is not internal")))
    }

    fn internal_mut(&mut self, id: NodeId) -> BPlusTreeResult<&mut InternalNode> {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.as_mut())
            .ok_or(BPlusTreeError::NodeNotFound(id))?
            .as_internal_mut()
            .ok_or_else(|| BPlusTreeError::InvalidState(format!("node {id} is not internal")))
    }

    /// Remove a leaf from storage and return it
    fn take_leaf(&mut self, id: NodeId) -> BPlusTreeResult<LeafNode> {
        self.leaf(id)?;
        match self.free_node(id) {
            Some(BPlusNode::Leaf(leaf)) => Ok(leaf),
            _ => Err(BPlusTreeError::NodeNotFound(id)),
        }
    }

    /// Remove an internal node from storage and return it
    fn take_internal(&mut self, id: NodeId) -> BPlusTreeResult<InternalNode> {
        self.internal(id)?;
        match self.free_node(id) {
            Some(BPlusNode::Internal(node)) => Ok(node),
            _ => Err(BPlusTreeError::NodeNotFound(id)),
        }
    }

    fn child_at(&self, id: NodeId, index: usize) -> BPlusTreeResult<NodeId> {
        self.internal(id)?
            .children
            .get(index)
            .copied()
            .ok_or_else(|| BPlusTreeError::InvalidState(format!("node {id} has no child {index}")))
    }

    /// Left and right neighbours of `parent.children[index]` under the same parent
    fn siblings(
        &self,
        parent_id: NodeId,
        index: usize,
    ) -> BPlusTreeResult<(Option<NodeId>, Option<NodeId>)> {
        let parent = self.internal(parent_id)?;
        let left = index
            .checked_sub(1)
            .and_then(|i| parent.children.get(i).copied());
        let right = parent.children.get(index + 1).copied();
        Ok((left, right))
    }

    // ========== Search Operations ==========

    /// Search for all entries whose primary key equals `key`
    pub fn search(&self, key: i32) -> Vec<RecordAddress> {
        self.range_search(key, key)
    }

    /// Point search reporting every visited node
    pub fn search_with<O: AccessObserver + ?Sized>(
        &self,
        key: i32,
        observer: &mut O,
    ) -> Vec<RecordAddress> {
        self.range_search_with(key, key, observer)
    }

    /// Range search: all entries with `lower <= primary <= upper`, in key order
    pub fn range_search(&self, lower: i32, upper: i32) -> Vec<RecordAddress> {
        self.range_search_with(lower, upper, &mut ())
    }

    /// Range search reporting every visited node
    pub fn range_search_with<O: AccessObserver + ?Sized>(
        &self,
        lower: i32,
        upper: i32,
        observer: &mut O,
    ) -> Vec<RecordAddress> {
        let mut results = Vec::new();

        if lower > upper {
            return results;
        }

        // Find the leaf containing the lower bound
        let mut current_id = self.find_leaf(&IndexKey::lowest(lower), &mut *observer);

        // Scan through leaf nodes
        while let Some(id) = current_id {
            let Some(node) = self.get_node(id) else {
                break;
            };
            observer.visit_node(id, node);
            let Some(leaf) = node.as_leaf() else {
                break;
            };

            for entry in &leaf.entries {
                let primary = entry.key.primary;
                if primary > upper {
                    return results;
                }
                if primary >= lower {
                    results.push(entry.address);
                }
            }

            current_id = leaf.next;
        }

        results
    }

    /// Check whether an entry with exactly this key exists
    pub fn contains_key(&self, key: &IndexKey) -> bool {
        self.iter_from(key).next().is_some_and(|entry| entry.key == *key)
    }

    /// Find the leaf node that should contain the given key
    ///
    /// Internal nodes on the way down are reported to `observer`; the leaf is not.
    fn find_leaf<O: AccessObserver + ?Sized>(
        &self,
        key: &IndexKey,
        observer: &mut O,
    ) -> Option<NodeId> {
        let mut current = self.root;

        loop {
            let node = self.get_node(current)?;
            match node {
                BPlusNode::Leaf(_) => return Some(current),
                BPlusNode::Internal(internal) => {
                    observer.visit_node(current, node);
                    current = *internal
                        .children
                        .get(internal.find_child_index(key))?;
                }
            }
        }
    }

    // ========== Insert Operations ==========

    /// Index a record stored at `address`
    pub fn insert(&mut self, record: &Record, address: RecordAddress) -> BPlusTreeResult<()> {
        let key = IndexKey::from_record(record)?;
        self.insert_entry(key, address)
    }

    /// Insert a key-address pair into the tree
    ///
    /// Keys are unique: inserting a key already present fails with
    /// [`BPlusTreeError::DuplicateKey`] and leaves the tree untouched.
    pub fn insert_entry(&mut self, key: IndexKey, address: RecordAddress) -> BPlusTreeResult<()> {
        if self.contains_key(&key) {
            return Err(BPlusTreeError::DuplicateKey(key.to_string()));
        }

        let entry = LeafEntry::new(key, address);

        if let Some(split) = self.insert_into(self.root, entry)? {
            // Split the root - create new root
            let old_root = self.root;
            let new_root = InternalNode::new(
                self.order,
                vec![split.separator],
                vec![old_root, split.node],
            );
            self.root = self.allocate_node(BPlusNode::Internal(new_root));
            self.events.root_splits += 1;
            tracing::trace!(root = self.root, height = self.height(), "root split");
        }

        self.entry_count += 1;
        Ok(())
    }

    /// Insert below `node_id`, returning the split to apply in the caller's frame
    fn insert_into(&mut self, node_id: NodeId, entry: LeafEntry) -> BPlusTreeResult<Option<Split>> {
        let child_id = match self.node(node_id)? {
            BPlusNode::Leaf(_) => return self.insert_into_leaf(node_id, entry),
            BPlusNode::Internal(node) => self.child_at(node_id, node.find_child_index(&entry.key))?,
        };

        let Some(split) = self.insert_into(child_id, entry)? else {
            return Ok(None);
        };

        let node = self.internal_mut(node_id)?;
        if !node.is_full() {
            node.insert_sorted(split.separator, split.node);
            return Ok(None);
        }

        // Split an overflowing internal node
        let (separator, right) = node.split_with(split.separator, split.node);
        let right_id = self.allocate_node(BPlusNode::Internal(right));
        self.events.internal_splits += 1;
        tracing::trace!(left = node_id, right = right_id, %separator, "internal split");

        Ok(Some(Split {
            separator,
            node: right_id,
        }))
    }

    fn insert_into_leaf(&mut self, leaf_id: NodeId, entry: LeafEntry) -> BPlusTreeResult<Option<Split>> {
        let leaf = self.leaf_mut(leaf_id)?;
        if !leaf.is_full() {
            leaf.insert_sorted(entry);
            return Ok(None);
        }

        // Split the leaf and link the new node right after it
        let mut right = leaf.split_with(entry);
        let old_next = leaf.next;
        right.prev = Some(leaf_id);
        right.next = old_next;
        let separator = right
            .first_key()
            .ok_or_else(|| BPlusTreeError::InvalidState("empty leaf after split".to_string()))?;

        let right_id = self.allocate_node(BPlusNode::Leaf(right));
        self.leaf_mut(leaf_id)?.next = Some(right_id);
        if let Some(next_id) = old_next {
            self.leaf_mut(next_id)?.prev = Some(right_id);
        }
        self.events.leaf_splits += 1;
        tracing::trace!(left = leaf_id, right = right_id, %separator, "leaf split");

        Ok(Some(Split {
            separator,
            node: right_id,
        }))
    }

    // ========== Delete Operations ==========

    /// Delete every entry whose primary key equals `key`
    ///
    /// Returns the number of entries removed (0 if the key was absent).
    pub fn delete(&mut self, key: i32) -> BPlusTreeResult<usize> {
        let mut removed = 0;

        while let Some(entry) = self.first_entry_with(key) {
            if !self.delete_key(&entry.key)? {
                return Err(BPlusTreeError::InvalidState(format!(
                    "entry {} reachable by scan but not by descent",
                    entry.key
                )));
            }
            removed += 1;
        }

        Ok(removed)
    }

    /// Delete the first entry with exactly this key
    ///
    /// Returns true if an entry was deleted.
    pub fn delete_key(&mut self, key: &IndexKey) -> BPlusTreeResult<bool> {
        let outcome = self.delete_from(None, self.root, key)?;

        // Collapse an internal root left with a single child
        loop {
            let root_id = self.root;
            let only_child = match self.node(root_id)? {
                BPlusNode::Internal(node) if node.len() == 1 => node.children[0],
                _ => break,
            };
            self.free_node(root_id);
            self.root = only_child;
            self.events.root_collapses += 1;
            tracing::trace!(root = only_child, "root collapse");
        }

        if outcome.found {
            self.entry_count -= 1;
        }
        Ok(outcome.found)
    }

    fn first_entry_with(&self, key: i32) -> Option<LeafEntry> {
        self.iter_from(&IndexKey::lowest(key))
            .next()
            .filter(|entry| entry.key.primary == key)
    }

    /// Delete below `node_id`; `parent` is `(parent_id, index of node_id in parent)`
    fn delete_from(
        &mut self,
        parent: Option<(NodeId, usize)>,
        node_id: NodeId,
        key: &IndexKey,
    ) -> BPlusTreeResult<DeleteOutcome> {
        let child_idx = match self.node(node_id)? {
            BPlusNode::Leaf(_) => return self.delete_from_leaf(parent, node_id, key),
            BPlusNode::Internal(node) => node.find_child_index(key),
        };
        let child_id = self.child_at(node_id, child_idx)?;

        let outcome = self.delete_from(Some((node_id, child_idx)), child_id, key)?;
        let Some(removed) = outcome.removed_child else {
            return Ok(outcome);
        };

        // A child was merged away: drop its separator and pointer
        let node = self.internal_mut(node_id)?;
        let separator_idx = removed.checked_sub(1).ok_or_else(|| {
            BPlusTreeError::InvalidState(format!("node {node_id} lost its leftmost child"))
        })?;
        node.delete_key_at(separator_idx);
        node.delete_pointer_at(removed);

        let underflow = node.is_underflow();
        match parent {
            Some((parent_id, index)) if underflow => {
                let removed_child = self.rebalance_internal(parent_id, index, node_id)?;
                Ok(DeleteOutcome::found(removed_child))
            }
            _ => Ok(DeleteOutcome::found(None)),
        }
    }

    fn delete_from_leaf(
        &mut self,
        parent: Option<(NodeId, usize)>,
        leaf_id: NodeId,
        key: &IndexKey,
    ) -> BPlusTreeResult<DeleteOutcome> {
        let leaf = self.leaf_mut(leaf_id)?;
        if leaf.delete_by_key(key).is_none() {
            return Ok(DeleteOutcome::not_found());
        }

        let underflow = leaf.is_underflow();
        match parent {
            Some((parent_id, index)) if underflow => {
                let removed_child = self.rebalance_leaf(parent_id, index, leaf_id)?;
                Ok(DeleteOutcome::found(removed_child))
            }
            _ => Ok(DeleteOutcome::found(None)),
        }
    }

    /// Fix an underflowing leaf; returns the index of a child merged away
    fn rebalance_leaf(
        &mut self,
        parent_id: NodeId,
        index: usize,
        leaf_id: NodeId,
    ) -> BPlusTreeResult<Option<usize>> {
        let (left, right) = self.siblings(parent_id, index)?;

        // Borrow the rightmost entry of the left sibling
        if let Some(left_id) = left {
            if self.leaf(left_id)?.can_lend() {
                let left_leaf = self.leaf_mut(left_id)?;
                let entry = left_leaf
                    .delete_by_index(left_leaf.len() - 1)
                    .ok_or_else(|| BPlusTreeError::InvalidState("empty lender".to_string()))?;
                self.leaf_mut(leaf_id)?.insert_sorted(entry);
                self.internal_mut(parent_id)?.keys[index - 1] = entry.key;
                self.events.borrows += 1;
                return Ok(None);
            }
        }

        // Borrow the leftmost entry of the right sibling
        if let Some(right_id) = right {
            if self.leaf(right_id)?.can_lend() {
                let right_leaf = self.leaf_mut(right_id)?;
                let entry = right_leaf
                    .delete_by_index(0)
                    .ok_or_else(|| BPlusTreeError::InvalidState("empty lender".to_string()))?;
                let new_first = right_leaf
                    .first_key()
                    .ok_or_else(|| BPlusTreeError::InvalidState("lender emptied".to_string()))?;
                self.leaf_mut(leaf_id)?.insert_sorted(entry);
                self.internal_mut(parent_id)?.keys[index] = new_first;
                self.events.borrows += 1;
                return Ok(None);
            }
        }

        // Merge: the right node of the pair is absorbed into the left one
        let (dest_id, source_id, removed) = match (left, right) {
            (_, Some(right_id)) => (leaf_id, right_id, index + 1),
            (Some(left_id), None) => (left_id, leaf_id, index),
            (None, None) => {
                return Err(BPlusTreeError::InvalidState(format!(
                    "leaf {leaf_id} has no sibling under {parent_id}"
                )));
            }
        };

        let mut source = self.take_leaf(source_id)?;
        let dest = self.leaf_mut(dest_id)?;
        dest.merge_from(&mut source);
        dest.next = source.next;
        if let Some(next_id) = source.next {
            self.leaf_mut(next_id)?.prev = Some(dest_id);
        }
        self.events.merges += 1;
        tracing::trace!(into = dest_id, from = source_id, "leaf merge");

        Ok(Some(removed))
    }

    /// Fix an underflowing internal node; returns the index of a child merged away
    fn rebalance_internal(
        &mut self,
        parent_id: NodeId,
        index: usize,
        node_id: NodeId,
    ) -> BPlusTreeResult<Option<usize>> {
        let (left, right) = self.siblings(parent_id, index)?;

        // Rotate the left sibling's last child through the parent
        if let Some(left_id) = left {
            if self.internal(left_id)?.can_lend() {
                let left_node = self.internal_mut(left_id)?;
                let last = left_node.len() - 1;
                let (key, child) = left_node
                    .delete_key_at(last - 1)
                    .zip(left_node.delete_pointer_at(last))
                    .ok_or_else(|| BPlusTreeError::InvalidState("empty lender".to_string()))?;
                let down = std::mem::replace(&mut self.internal_mut(parent_id)?.keys[index - 1], key);
                let node = self.internal_mut(node_id)?;
                node.keys.insert(0, down);
                node.children.insert(0, child);
                self.events.borrows += 1;
                return Ok(None);
            }
        }

        // Rotate the right sibling's first child through the parent
        if let Some(right_id) = right {
            if self.internal(right_id)?.can_lend() {
                let right_node = self.internal_mut(right_id)?;
                let (key, child) = right_node
                    .delete_key_at(0)
                    .zip(right_node.delete_pointer_at(0))
                    .ok_or_else(|| BPlusTreeError::InvalidState("empty lender".to_string()))?;
                let down = std::mem::replace(&mut self.internal_mut(parent_id)?.keys[index], key);
                let node = self.internal_mut(node_id)?;
                node.keys.push(down);
                node.children.push(child);
                self.events.borrows += 1;
                return Ok(None);
            }
        }

        // Merge, pulling the separator between the pair down
        let (dest_id, source_id, separator_idx) = match (left, right) {
            (_, Some(right_id)) => (node_id, right_id, index),
            (Some(left_id), None) => (left_id, node_id, index - 1),
            (None, None) => {
                return Err(BPlusTreeError::InvalidState(format!(
                    "node {node_id} has no sibling under {parent_id}"
                )));
            }
        };

        let separator = self.internal(parent_id)?.keys[separator_idx];
        let mut source = self.take_internal(source_id)?;
        self.internal_mut(dest_id)?.merge_from(separator, &mut source);
        self.events.merges += 1;
        tracing::trace!(into = dest_id, from = source_id, "internal merge");

        Ok(Some(separator_idx + 1))
    }

    // ========== Verification ==========

    /// Check every structural invariant of the tree
    ///
    /// - all leaves at the same depth
    /// - non-root degrees within bounds; an internal root has at least 2 children
    /// - `keys + 1 == children` and every key within its separator bounds
    /// - the leaf chain visits every leaf once, in order, with consistent back links
    /// - no record address is indexed twice
    pub fn validate(&self) -> BPlusTreeResult<()> {
        let mut leaves = Vec::new();
        let mut leaf_depth = None;
        let mut visited = 0;
        self.validate_node(self.root, 1, None, None, &mut leaves, &mut leaf_depth, &mut visited)?;

        if visited != self.node_count() {
            return Err(BPlusTreeError::InvalidState(format!(
                "{} live nodes but {} reachable",
                self.node_count(),
                visited
            )));
        }

        // Walk the sibling chain and compare with the in-order leaf list
        let mut chain = Vec::new();
        let mut prev = None;
        let mut current = leaves.first().copied();
        while let Some(id) = current {
            let leaf = self.leaf(id)?;
            if leaf.prev != prev {
                return Err(BPlusTreeError::InvalidState(format!(
                    "leaf {id} has prev {:?}, expected {:?}",
                    leaf.prev, prev
                )));
            }
            if chain.len() > leaves.len() {
                return Err(BPlusTreeError::InvalidState("leaf chain has a cycle".to_string()));
            }
            chain.push(id);
            prev = Some(id);
            current = leaf.next;
        }
        if chain != leaves {
            return Err(BPlusTreeError::InvalidState(format!(
                "leaf chain {chain:?} differs from tree order {leaves:?}"
            )));
        }

        let mut addresses = HashSet::new();
        let mut last_key: Option<IndexKey> = None;
        let mut count = 0;
        for entry in self.iter() {
            if last_key.is_some_and(|k| k > entry.key) {
                return Err(BPlusTreeError::InvalidState(format!(
                    "entries out of order at {}",
                    entry.key
                )));
            }
            if !addresses.insert(entry.address) {
                return Err(BPlusTreeError::InvalidState(format!(
                    "address {} indexed twice",
                    entry.address
                )));
            }
            last_key = Some(entry.key);
            count += 1;
        }
        if count != self.entry_count {
            return Err(BPlusTreeError::InvalidState(format!(
                "{count} entries reachable but {} recorded",
                self.entry_count
            )));
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_node(
        &self,
        id: NodeId,
        depth: usize,
        lower: Option<IndexKey>,
        upper: Option<IndexKey>,
        leaves: &mut Vec<NodeId>,
        leaf_depth: &mut Option<usize>,
        visited: &mut usize,
    ) -> BPlusTreeResult<()> {
        let node = self.node(id)?;
        let is_root = id == self.root;
        *visited += 1;

        if !is_root && node.is_underflow() {
            return Err(BPlusTreeError::InvalidState(format!(
                "node {id} underflows with degree {}",
                node.degree()
            )));
        }

        let in_bounds = |key: &IndexKey| {
            lower.is_none_or(|l| *key >= l) && upper.is_none_or(|u| *key < u)
        };

        match node {
            BPlusNode::Leaf(leaf) => {
                if leaf.len() > leaf.max_degree() {
                    return Err(BPlusTreeError::InvalidState(format!("leaf {id} overflows")));
                }
                if let Some(entry) = leaf.entries.iter().find(|e| !in_bounds(&e.key)) {
                    return Err(BPlusTreeError::InvalidState(format!(
                        "key {} out of bounds in leaf {id}",
                        entry.key
                    )));
                }
                match *leaf_depth {
                    Some(d) if d != depth => {
                        return Err(BPlusTreeError::InvalidState(format!(
                            "leaf {id} at depth {depth}, expected {d}"
                        )));
                    }
                    _ => *leaf_depth = Some(depth),
                }
                leaves.push(id);
            }
            BPlusNode::Internal(internal) => {
                if internal.keys.len() + 1 != internal.children.len() {
                    return Err(BPlusTreeError::InvalidState(format!(
                        "node {id} has {} keys and {} children",
                        internal.keys.len(),
                        internal.children.len()
                    )));
                }
                if internal.len() > internal.max_degree() || (is_root && internal.len() < 2) {
                    return Err(BPlusTreeError::InvalidState(format!(
                        "node {id} has degree {}",
                        internal.len()
                    )));
                }
                if internal.keys.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(BPlusTreeError::InvalidState(format!("node {id} keys unsorted")));
                }
                if let Some(key) = internal.keys.iter().find(|&k| !in_bounds(k)) {
                    return Err(BPlusTreeError::InvalidState(format!(
                        "separator {key} out of bounds in node {id}"
                    )));
                }

                for (i, &child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(internal.keys[i - 1]) };
                    let child_upper = internal.keys.get(i).copied().or(upper);
                    self.validate_node(
                        child,
                        depth + 1,
                        child_lower,
                        child_upper,
                        leaves,
                        leaf_depth,
                        visited,
                    )?;
                }
            }
        }

        Ok(())
    }

    // ========== Iterator ==========

    /// Iterate over all entries in key order
    pub fn iter(&self) -> BPlusTreeIter<'_> {
        let mut current = self.root;
        while let Some(BPlusNode::Internal(node)) = self.get_node(current) {
            match node.children.first() {
                Some(&child) => current = child,
                None => break,
            }
        }
        BPlusTreeIter::new(self, Some(current), 0)
    }

    /// Iterate over entries with key `>= key`, in key order
    pub fn iter_from(&self, key: &IndexKey) -> BPlusTreeIter<'_> {
        let leaf_id = self.find_leaf(key, &mut ());
        let start = leaf_id
            .and_then(|id| self.get_node(id))
            .and_then(|node| node.as_leaf())
            .map(|leaf| leaf.entries.partition_point(|e| e.key < *key))
            .unwrap_or(0);
        BPlusTreeIter::new(self, leaf_id, start)
    }
}

/// Iterator over B+ tree entries along the leaf chain
pub struct BPlusTreeIter<'a> {
    tree: &'a BPlusTree,
    current_leaf: Option<NodeId>,
    current_idx: usize,
}

impl<'a> BPlusTreeIter<'a> {
    fn new(tree: &'a BPlusTree, current_leaf: Option<NodeId>, current_idx: usize) -> Self {
        Self {
            tree,
            current_leaf,
            current_idx,
        }
    }
}

impl Iterator for BPlusTreeIter<'_> {
    type Item = LeafEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf_id = self.current_leaf?;
            let leaf = self.tree.get_node(leaf_id)?.as_leaf()?;

            if let Some(&entry) = leaf.entries.get(self.current_idx) {
                self.current_idx += 1;
                return Some(entry);
            }

            // Move to next leaf
            self.current_leaf = leaf.next;
            self.current_idx = 0;
        }
    }
}
