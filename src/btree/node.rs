use crate::record::RecordAddress;

use super::IndexKey;

/// Node identifier (index into node storage)
pub type NodeId = usize;

/// Leaf payload: an index key and the address of the record it points to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: IndexKey,
    pub address: RecordAddress,
}

impl LeafEntry {
    pub fn new(key: IndexKey, address: RecordAddress) -> Self {
        Self { key, address }
    }
}

/// Internal node: stores separator keys and child pointers
///
/// - `keys.len() + 1 == children.len()`
/// - every key under `children[i]` is `< keys[i]` and `>= keys[i - 1]`
/// - holds at most `order` keys (`order + 1` children)
#[derive(Debug, Clone)]
pub struct InternalNode {
    order: usize,
    /// Separator keys
    pub keys: Vec<IndexKey>,
    /// Child node IDs
    pub children: Vec<NodeId>,
}

impl InternalNode {
    /// Create a new internal node with given keys and children
    pub fn new(order: usize, keys: Vec<IndexKey>, children: Vec<NodeId>) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        Self {
            order,
            keys,
            children,
        }
    }

    /// Number of children (the degree of an internal node)
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Check if node is empty
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Maximum number of children
    pub fn max_degree(&self) -> usize {
        self.order + 1
    }

    /// Minimum number of children for a non-root node
    pub fn min_degree(&self) -> usize {
        self.order / 2 + 1
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_degree()
    }

    pub fn is_underflow(&self) -> bool {
        self.len() < self.min_degree()
    }

    /// Whether a child can be given away without underflowing
    pub fn can_lend(&self) -> bool {
        self.len() > self.min_degree()
    }

    /// Index of the child whose subtree may contain `key`
    ///
    /// This is the position of the first separator strictly greater than `key`;
    /// a key equal to a separator belongs to the subtree on its right.
    pub fn find_child_index(&self, key: &IndexKey) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Insert a separator and the child to its right, keeping keys sorted
    pub fn insert_sorted(&mut self, separator: IndexKey, child: NodeId) {
        let pos = self.find_child_index(&separator);
        self.keys.insert(pos, separator);
        self.children.insert(pos + 1, child);
    }

    /// Remove and return the separator at `index`
    pub fn delete_key_at(&mut self, index: usize) -> Option<IndexKey> {
        (index < self.keys.len()).then(|| self.keys.remove(index))
    }

    /// Remove and return the child pointer at `index`
    pub fn delete_pointer_at(&mut self, index: usize) -> Option<NodeId> {
        (index < self.children.len()).then(|| self.children.remove(index))
    }

    /// Append `other` to this node, pulling `separator` down between them
    ///
    /// `other` must be the right neighbour and `separator` the parent key that
    /// divided the two. `other` is left empty.
    pub fn merge_from(&mut self, separator: IndexKey, other: &mut InternalNode) {
        self.keys.push(separator);
        self.keys.append(&mut other.keys);
        self.children.append(&mut other.children);
    }

    /// Split a full node while inserting `(separator, child)`
    ///
    /// The combined `order + 1` keys are cut at `mid = (order + 1) / 2`: this
    /// node keeps `keys[..mid]`, the returned right node gets `keys[mid + 1..]`
    /// and `keys[mid]` is returned for promotion (it stays in neither half).
    pub fn split_with(&mut self, separator: IndexKey, child: NodeId) -> (IndexKey, InternalNode) {
        self.insert_sorted(separator, child);

        let mid = (self.order + 1) / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let promoted = self.keys.remove(mid);

        (
            promoted,
            InternalNode::new(self.order, right_keys, right_children),
        )
    }
}

/// Leaf node: stores sorted entries, doubly linked to its neighbours
#[derive(Debug, Clone)]
pub struct LeafNode {
    order: usize,
    /// Entries sorted by key
    pub entries: Vec<LeafEntry>,
    /// Link to previous leaf
    pub prev: Option<NodeId>,
    /// Link to next leaf for range queries
    pub next: Option<NodeId>,
}

impl LeafNode {
    /// Create a new empty leaf node
    pub fn new(order: usize) -> Self {
        Self::with_entries(order, Vec::new())
    }

    /// Create a leaf node with given entries
    pub fn with_entries(order: usize, entries: Vec<LeafEntry>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].key <= w[1].key));
        Self {
            order,
            entries,
            prev: None,
            next: None,
        }
    }

    /// Number of entries (the degree of a leaf)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if leaf is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn max_degree(&self) -> usize {
        self.order
    }

    /// Minimum number of entries for a non-root leaf
    pub fn min_degree(&self) -> usize {
        (self.order + 1) / 2
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_degree()
    }

    pub fn is_underflow(&self) -> bool {
        self.len() < self.min_degree()
    }

    /// Whether an entry can be given away without underflowing
    pub fn can_lend(&self) -> bool {
        self.len() > self.min_degree()
    }

    /// Insert an entry in sorted order, after any entries with an equal key
    pub fn insert_sorted(&mut self, entry: LeafEntry) {
        let pos = self.entries.partition_point(|e| e.key <= entry.key);
        self.entries.insert(pos, entry);
    }

    /// Position of the first entry with exactly this key
    pub fn position(&self, key: &IndexKey) -> Option<usize> {
        let pos = self.entries.partition_point(|e| e.key < *key);
        (self.entries.get(pos)?.key == *key).then_some(pos)
    }

    /// Delete the first entry with the given key
    pub fn delete_by_key(&mut self, key: &IndexKey) -> Option<LeafEntry> {
        let pos = self.position(key)?;
        Some(self.entries.remove(pos))
    }

    /// Delete the entry at `index`
    pub fn delete_by_index(&mut self, index: usize) -> Option<LeafEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Append the entries of the right neighbour `other`, leaving it empty
    pub fn merge_from(&mut self, other: &mut LeafNode) {
        self.entries.append(&mut other.entries);
    }

    /// Split a full leaf while inserting `entry`
    ///
    /// The combined `order + 1` entries are cut at `mid = ceil((order + 1) / 2)`;
    /// this node keeps the first `mid`, the returned node gets the rest. Sibling
    /// links are left to the caller.
    pub fn split_with(&mut self, entry: LeafEntry) -> LeafNode {
        self.insert_sorted(entry);
        let mid = (self.order + 1).div_ceil(2);
        let right = self.entries.split_off(mid);
        LeafNode::with_entries(self.order, right)
    }

    /// Get the minimum key in this leaf
    pub fn first_key(&self) -> Option<IndexKey> {
        self.entries.first().map(|e| e.key)
    }
}

/// B+ tree node (either internal or leaf)
#[derive(Debug, Clone)]
pub enum BPlusNode {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl BPlusNode {
    /// Check if this is a leaf node
    pub fn is_leaf(&self) -> bool {
        matches!(self, BPlusNode::Leaf(_))
    }

    /// Check if this is an internal node
    pub fn is_internal(&self) -> bool {
        matches!(self, BPlusNode::Internal(_))
    }

    /// Entries in a leaf, children in an internal node
    pub fn degree(&self) -> usize {
        match self {
            BPlusNode::Internal(node) => node.len(),
            BPlusNode::Leaf(node) => node.len(),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            BPlusNode::Internal(node) => node.is_full(),
            BPlusNode::Leaf(node) => node.is_full(),
        }
    }

    pub fn is_underflow(&self) -> bool {
        match self {
            BPlusNode::Internal(node) => node.is_underflow(),
            BPlusNode::Leaf(node) => node.is_underflow(),
        }
    }

    pub fn can_lend(&self) -> bool {
        match self {
            BPlusNode::Internal(node) => node.can_lend(),
            BPlusNode::Leaf(node) => node.can_lend(),
        }
    }

    /// Separators of an internal node, entry keys of a leaf
    pub fn keys(&self) -> Box<dyn Iterator<Item = &IndexKey> + '_> {
        match self {
            BPlusNode::Internal(node) => Box::new(node.keys.iter()),
            BPlusNode::Leaf(node) => Box::new(node.entries.iter().map(|e| &e.key)),
        }
    }

    /// Get as internal node reference
    pub fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            BPlusNode::Internal(node) => Some(node),
            BPlusNode::Leaf(_) => None,
        }
    }

    /// Get as internal node mutable reference
    pub fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match self {
            BPlusNode::Internal(node) => Some(node),
            BPlusNode::Leaf(_) => None,
        }
    }

    /// Get as leaf node reference
    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            BPlusNode::Internal(_) => None,
            BPlusNode::Leaf(node) => Some(node),
        }
    }

    /// Get as leaf node mutable reference
    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match self {
            BPlusNode::Internal(_) => None,
            BPlusNode::Leaf(node) => Some(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(primary: i32) -> IndexKey {
        IndexKey::lowest(primary)
    }

    fn entry(primary: i32, slot: usize) -> LeafEntry {
        LeafEntry::new(key(primary), RecordAddress::new(0, slot))
    }

    fn primaries(leaf: &LeafNode) -> Vec<i32> {
        leaf.entries.iter().map(|e| e.key.primary).collect()
    }

    #[test]
    fn test_leaf_degree_bounds() {
        let mut leaf = LeafNode::new(3);
        assert_eq!(leaf.max_degree(), 3);
        assert_eq!(leaf.min_degree(), 2);
        assert!(leaf.is_underflow());

        leaf.insert_sorted(entry(1, 0));
        leaf.insert_sorted(entry(2, 1));
        assert!(!leaf.is_underflow());
        assert!(!leaf.can_lend());

        leaf.insert_sorted(entry(3, 2));
        assert!(leaf.is_full());
        assert!(leaf.can_lend());

        assert_eq!(LeafNode::new(4).min_degree(), 2);
        assert_eq!(LeafNode::new(5).min_degree(), 3);
    }

    #[test]
    fn test_leaf_insert_sorted() {
        let mut leaf = LeafNode::new(8);

        leaf.insert_sorted(entry(5, 0));
        leaf.insert_sorted(entry(3, 1));
        leaf.insert_sorted(entry(7, 2));
        leaf.insert_sorted(entry(3, 3)); // Duplicate key

        assert_eq!(primaries(&leaf), vec![3, 3, 5, 7]);
        // Equal keys keep insertion order
        assert_eq!(leaf.entries[0].address.slot_id, 1);
        assert_eq!(leaf.entries[1].address.slot_id, 3);
    }

    #[test]
    fn test_leaf_delete() {
        let mut leaf = LeafNode::new(4);
        for (i, p) in [3, 5, 7].into_iter().enumerate() {
            leaf.insert_sorted(entry(p, i));
        }

        assert_eq!(leaf.delete_by_key(&key(5)), Some(entry(5, 1)));
        assert_eq!(leaf.delete_by_key(&key(5)), None);
        assert_eq!(leaf.position(&key(7)), Some(1));
        assert_eq!(leaf.delete_by_index(0), Some(entry(3, 0)));
        assert_eq!(leaf.delete_by_index(4), None);
        assert_eq!(primaries(&leaf), vec![7]);
    }

    #[test]
    fn test_leaf_merge() {
        let mut left = LeafNode::with_entries(4, vec![entry(1, 0), entry(2, 1)]);
        let mut right = LeafNode::with_entries(4, vec![entry(3, 2)]);

        left.merge_from(&mut right);
        assert_eq!(primaries(&left), vec![1, 2, 3]);
        assert!(right.is_empty());
    }

    #[test]
    fn test_leaf_split() {
        let mut leaf = LeafNode::new(3);
        for (i, p) in [1, 5, 8].into_iter().enumerate() {
            leaf.insert_sorted(entry(p, i));
        }

        let right = leaf.split_with(entry(7, 3));
        assert_eq!(primaries(&leaf), vec![1, 5]);
        assert_eq!(primaries(&right), vec![7, 8]);

        let mut leaf = LeafNode::new(4);
        for (i, p) in [10, 20, 30, 40].into_iter().enumerate() {
            leaf.insert_sorted(entry(p, i));
        }
        let right = leaf.split_with(entry(25, 4));
        assert_eq!(primaries(&leaf), vec![10, 20, 25]);
        assert_eq!(primaries(&right), vec![30, 40]);
        assert_eq!(right.first_key(), Some(key(30)));
    }

    #[test]
    fn test_internal_degree_bounds() {
        let node = InternalNode::new(3, vec![key(5)], vec![0, 1]);
        assert_eq!(node.max_degree(), 4);
        assert_eq!(node.min_degree(), 2);
        assert!(!node.is_underflow());
        assert!(!node.can_lend());

        let node = InternalNode::new(4, vec![key(5)], vec![0, 1]);
        assert_eq!(node.min_degree(), 3);
        assert!(node.is_underflow());
    }

    #[test]
    fn test_internal_node_find_child() {
        let node = InternalNode::new(4, vec![key(3), key(7), key(12)], vec![0, 1, 2, 3]);

        assert_eq!(node.find_child_index(&key(1)), 0);
        assert_eq!(node.find_child_index(&key(3)), 1); // == separator goes right
        assert_eq!(node.find_child_index(&key(5)), 1);
        assert_eq!(node.find_child_index(&key(7)), 2);
        assert_eq!(node.find_child_index(&key(15)), 3);
        assert_eq!(
            node.find_child_index(&IndexKey::new(3, *b"tt00000001")),
            1
        );
    }

    #[test]
    fn test_internal_node_insert_and_delete() {
        let mut node = InternalNode::new(4, vec![key(3), key(12)], vec![0, 1, 3]);

        node.insert_sorted(key(7), 2);
        assert_eq!(node.keys, vec![key(3), key(7), key(12)]);
        assert_eq!(node.children, vec![0, 1, 2, 3]);

        assert_eq!(node.delete_key_at(1), Some(key(7)));
        assert_eq!(node.delete_pointer_at(2), Some(2));
        assert_eq!(node.delete_key_at(5), None);
        assert_eq!(node.keys, vec![key(3), key(12)]);
        assert_eq!(node.children, vec![0, 1, 3]);
    }

    #[test]
    fn test_internal_node_split() {
        // order 3: 4 keys after insertion, mid = 2
        let mut node = InternalNode::new(3, vec![key(3), key(7), key(9)], vec![0, 1, 2, 3]);
        assert!(node.is_full());

        let (promoted, right) = node.split_with(key(12), 4);
        assert_eq!(promoted, key(9));
        assert_eq!(node.keys, vec![key(3), key(7)]);
        assert_eq!(node.children, vec![0, 1, 2]);
        assert_eq!(right.keys, vec![key(12)]);
        assert_eq!(right.children, vec![3, 4]);
    }

    #[test]
    fn test_internal_node_merge() {
        let mut left = InternalNode::new(4, vec![key(3)], vec![0, 1]);
        let mut right = InternalNode::new(4, vec![key(12)], vec![2, 3]);

        left.merge_from(key(7), &mut right);
        assert_eq!(left.keys, vec![key(3), key(7), key(12)]);
        assert_eq!(left.children, vec![0, 1, 2, 3]);
        assert!(right.is_empty());
    }

    #[test]
    fn test_node_keys() {
        let leaf = BPlusNode::Leaf(LeafNode::with_entries(3, vec![entry(1, 0), entry(4, 1)]));
        let internal = BPlusNode::Internal(InternalNode::new(3, vec![key(9)], vec![0, 1]));

        assert_eq!(leaf.keys().map(|k| k.primary).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(internal.keys().map(|k| k.primary).collect::<Vec<_>>(), vec![9]);
        assert_eq!(leaf.degree(), 2);
        assert_eq!(internal.degree(), 2);
        assert!(leaf.is_leaf() && internal.is_internal());
    }
}
