//! On-disk B-tree index with a location-keyed node cache.
//!
//! Each index maps fixed-size keys to value references and lives in files
//! `idx_<id>_<n>.dat`. File 0 starts with a 12-byte header:
//!
//! ```text
//! [last_file: u16][last_size: u32][root_file: u16][root_offset: u32]
//! ```
//!
//! followed by node regions (see [`node`]). Nodes are addressed by their
//! `(file, offset)` location; a subset of them, filled breadth-first from the
//! root at load time, is mirrored in an in-memory cache up to a byte budget.
//!
//! Inserts follow the classic order-64 B-tree scheme: a full node splits
//! around its median, the halves keep 32 elements each, and the median climbs
//! into the parent. Splits write new nodes as plain appends and mutate
//! existing nodes through journaled byte-range overwrites, so an interrupted
//! commit can always be rolled back. Deletes only tombstone the element
//! length; slots are never reclaimed and nodes never rebalance.

mod cursor;
mod node;

use std::collections::{HashMap, VecDeque};

use byteorder::{ByteOrder, LittleEndian};

pub(crate) use cursor::TreeCursor;
pub(crate) use node::{Element, Node, NodeLocation, ORDER};

use node::{child_offset, element_offset, node_len, CHILD_SIZE, ELEMENT_FIXED, HALF};

use crate::error::Result;
use crate::pager::{FileKey, Pager};
use crate::types::{ValueRef, DELETED};

/// Fixed per-node cache accounting overhead on top of the key bytes.
const NODE_CACHE_OVERHEAD: usize = 128;

/// Size of the index file 0 header.
pub(crate) const HEADER_SIZE: u32 = 12;

/// Result of a descent that remembers the path taken.
#[derive(Debug)]
pub(crate) struct FindPath {
    /// Whether the key was found exactly.
    pub(crate) found: bool,
    /// Node the descent stopped in.
    pub(crate) loc: NodeLocation,
    /// Copy of that node.
    pub(crate) node: Node,
    /// Element index (exact match) or insertion point.
    pub(crate) idx: usize,
    /// `(location, child index)` of every ancestor, root first.
    pub(crate) parents: Vec<(NodeLocation, usize)>,
}

/// One loaded B-tree index.
#[derive(Debug)]
pub(crate) struct Index {
    id: u8,
    key_size: u8,
    /// Header values as currently on disk.
    last_file: u16,
    last_size: u32,
    /// Where the next appended node goes; folded into the header at commit.
    new_last_file: u16,
    new_last_size: u32,
    root: NodeLocation,
    cache: HashMap<NodeLocation, Node>,
    cache_limit: usize,
}

impl Index {
    /// Open an index, creating its first file with an empty root if needed.
    pub(crate) fn load(pager: &mut Pager, id: u8, key_size: u8, cache_limit: usize) -> Result<Index> {
        let file0 = FileKey::Index(id, 0);
        let nlen = node_len(key_size);
        if pager.file_len(file0)? == 0 {
            let root = NodeLocation { file: 0, offset: HEADER_SIZE };
            let mut header = [0u8; HEADER_SIZE as usize];
            LittleEndian::write_u16(&mut header[0..2], 0);
            LittleEndian::write_u32(&mut header[2..6], HEADER_SIZE + nlen);
            root.encode(&mut header[6..12]);
            pager.append(file0, &header)?;
            pager.append_zeros(file0, nlen as usize)?;
            let mut cache = HashMap::new();
            cache.insert(root, Node::empty());
            return Ok(Index {
                id,
                key_size,
                last_file: 0,
                last_size: HEADER_SIZE + nlen,
                new_last_file: 0,
                new_last_size: HEADER_SIZE + nlen,
                root,
                cache,
                cache_limit,
            });
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        pager.read(file0, 0, &mut header)?;
        let last_file = LittleEndian::read_u16(&header[0..2]);
        let last_size = LittleEndian::read_u32(&header[2..6]);
        let root = NodeLocation::decode(&header[6..12]);
        let mut index = Index {
            id,
            key_size,
            last_file,
            last_size,
            new_last_file: last_file,
            new_last_size: last_size,
            root,
            cache: HashMap::new(),
            cache_limit,
        };
        index.warm_cache(pager)?;
        Ok(index)
    }

    /// Fill the cache breadth-first from the root until the budget is spent.
    /// The root is always cached.
    fn warm_cache(&mut self, pager: &mut Pager) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        while let Some(loc) = queue.pop_front() {
            if !self.cache.is_empty() && !self.within_budget() {
                break;
            }
            let node = self.read_node(pager, loc)?;
            for child in &node.children {
                if !child.is_none() {
                    queue.push_back(*child);
                }
            }
            self.cache.insert(loc, node);
        }
        Ok(())
    }

    fn node_cost(&self) -> usize {
        self.key_size as usize * ORDER + NODE_CACHE_OVERHEAD
    }

    fn within_budget(&self) -> bool {
        (self.cache.len() + 1) * self.node_cost() <= self.cache_limit
    }

    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    pub(crate) fn key_size(&self) -> u8 {
        self.key_size
    }

    pub(crate) fn root(&self) -> NodeLocation {
        self.root
    }

    /// Header values recorded in the journal before a commit mutates them.
    pub(crate) fn header_state(&self) -> (u16, u32) {
        (self.last_file, self.last_size)
    }

    fn file_key(&self, file: u16) -> FileKey {
        FileKey::Index(self.id, file)
    }

    fn read_node(&self, pager: &mut Pager, loc: NodeLocation) -> Result<Node> {
        let mut buf = vec![0u8; node_len(self.key_size) as usize];
        pager.read(FileKey::Index(self.id, loc.file), loc.offset, &mut buf)?;
        Ok(Node::decode(&buf, self.key_size))
    }

    /// Fetch a node copy, from cache when present.
    pub(crate) fn node(&mut self, pager: &mut Pager, loc: NodeLocation) -> Result<Node> {
        if let Some(node) = self.cache.get(&loc) {
            return Ok(node.clone());
        }
        self.read_node(pager, loc)
    }

    fn refresh(&mut self, loc: NodeLocation, node: &Node) {
        if let Some(cached) = self.cache.get_mut(&loc) {
            *cached = node.clone();
        }
    }

    fn maybe_cache(&mut self, loc: NodeLocation, node: Node) {
        if self.within_budget() {
            self.cache.insert(loc, node);
        }
    }

    // -- lookups ------------------------------------------------------------

    /// Plain lookup without path tracking.
    pub(crate) fn find(&mut self, pager: &mut Pager, key: &[u8]) -> Result<Option<Element>> {
        let mut loc = self.root;
        loop {
            let node = self.node(pager, loc)?;
            match node.search(key) {
                Ok(i) => return Ok(Some(node.elements[i].clone())),
                Err(i) => {
                    let child = node.children[i];
                    if child.is_none() {
                        return Ok(None);
                    }
                    loc = child;
                },
            }
        }
    }

    /// Lookup that records the descent for insertion or iteration.
    pub(crate) fn find_with_parents(&mut self, pager: &mut Pager, key: &[u8]) -> Result<FindPath> {
        let mut parents = Vec::new();
        let mut loc = self.root;
        loop {
            let node = self.node(pager, loc)?;
            match node.search(key) {
                Ok(i) => return Ok(FindPath { found: true, loc, node, idx: i, parents }),
                Err(i) => {
                    let child = node.children[i];
                    if child.is_none() {
                        return Ok(FindPath { found: false, loc, node, idx: i, parents });
                    }
                    parents.push((loc, i));
                    loc = child;
                },
            }
        }
    }

    // -- element mutation ---------------------------------------------------

    /// Overwrite the value reference of an existing element in place.
    pub(crate) fn set_element_value(
        &mut self,
        pager: &mut Pager,
        loc: NodeLocation,
        idx: usize,
        value: ValueRef,
    ) -> Result<()> {
        let mut buf = [0u8; ELEMENT_FIXED];
        LittleEndian::write_u16(&mut buf[0..2], value.file);
        LittleEndian::write_u32(&mut buf[2..6], value.len);
        LittleEndian::write_u32(&mut buf[6..10], value.pos);
        let at = loc.offset + element_offset(idx, self.key_size);
        pager.overwrite(self.file_key(loc.file), at, &buf)?;
        if let Some(node) = self.cache.get_mut(&loc) {
            node.elements[idx].value = value;
        }
        Ok(())
    }

    /// Tombstone an element by rewriting only its length field.
    pub(crate) fn tombstone(&mut self, pager: &mut Pager, loc: NodeLocation, idx: usize) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, DELETED);
        let at = loc.offset + element_offset(idx, self.key_size) + 2;
        pager.overwrite(self.file_key(loc.file), at, &buf)?;
        if let Some(node) = self.cache.get_mut(&loc) {
            node.elements[idx].value.len = DELETED;
        }
        Ok(())
    }

    // -- insertion ----------------------------------------------------------

    /// Insert a new element at the position a `find_with_parents` descent
    /// stopped at, splitting upward as needed.
    pub(crate) fn insert(&mut self, pager: &mut Pager, path: FindPath, element: Element) -> Result<()> {
        let FindPath { mut loc, mut node, mut idx, mut parents, .. } = path;
        let mut element = element;
        let mut right = NodeLocation::NONE;
        loop {
            if node.len() < ORDER {
                node.elements.insert(idx, element);
                node.children.insert(idx + 1, right);
                self.write_count(pager, loc, node.len() as u8)?;
                self.write_element_range(pager, loc, &node, idx, node.len())?;
                if !right.is_none() {
                    self.write_child_range(pager, loc, &node, idx + 1, node.len() + 1)?;
                }
                self.refresh(loc, &node);
                return Ok(());
            }

            // Full node: split around the median of the 65 candidates.
            let mut elements = std::mem::take(&mut node.elements);
            let mut children = std::mem::take(&mut node.children);
            elements.insert(idx, element);
            children.insert(idx + 1, right);
            let right_elements = elements.split_off(HALF + 1);
            let right_children = children.split_off(HALF + 1);
            let median = elements.pop().unwrap();
            let left = Node { elements, children };
            let right_node = Node { elements: right_elements, children: right_children };

            let new_loc = self.new_node_position();
            pager.append(self.file_key(new_loc.file), &right_node.encode(self.key_size))?;

            self.write_count(pager, loc, HALF as u8)?;
            if idx < HALF {
                // Insertion landed in the left half, so its slots shifted.
                self.write_element_range(pager, loc, &left, idx, HALF)?;
                if !left.children[0].is_none() {
                    self.write_child_range(pager, loc, &left, idx + 1, HALF + 1)?;
                }
            }
            self.refresh(loc, &left);
            self.maybe_cache(new_loc, right_node);

            match parents.pop() {
                Some((parent_loc, parent_idx)) => {
                    node = self.node(pager, parent_loc)?;
                    loc = parent_loc;
                    idx = parent_idx;
                    element = median;
                    right = new_loc;
                },
                None => {
                    // Root split: the tree grows one level.
                    let root_loc = self.new_node_position();
                    let root = Node { elements: vec![median], children: vec![loc, new_loc] };
                    pager.append(self.file_key(root_loc.file), &root.encode(self.key_size))?;
                    let mut buf = [0u8; CHILD_SIZE];
                    root_loc.encode(&mut buf);
                    pager.overwrite(self.file_key(0), 6, &buf)?;
                    self.root = root_loc;
                    self.maybe_cache(root_loc, root);
                    return Ok(());
                },
            }
        }
    }

    /// Hand out the next append position, rolling to a new file on overflow.
    fn new_node_position(&mut self) -> NodeLocation {
        let nlen = node_len(self.key_size);
        if self.new_last_size > u32::MAX - nlen {
            self.new_last_file += 1;
            self.new_last_size = nlen;
            NodeLocation { file: self.new_last_file, offset: 0 }
        } else {
            let loc = NodeLocation { file: self.new_last_file, offset: self.new_last_size };
            self.new_last_size += nlen;
            loc
        }
    }

    /// Fold the append position into the on-disk header if it moved.
    pub(crate) fn flush_header(&mut self, pager: &mut Pager) -> Result<()> {
        if self.last_file != self.new_last_file || self.last_size != self.new_last_size {
            let mut buf = [0u8; 6];
            LittleEndian::write_u16(&mut buf[0..2], self.new_last_file);
            LittleEndian::write_u32(&mut buf[2..6], self.new_last_size);
            pager.overwrite(self.file_key(0), 0, &buf)?;
            self.last_file = self.new_last_file;
            self.last_size = self.new_last_size;
        }
        Ok(())
    }

    // -- raw range writes ---------------------------------------------------

    fn write_count(&mut self, pager: &mut Pager, loc: NodeLocation, count: u8) -> Result<()> {
        pager.overwrite(self.file_key(loc.file), loc.offset, &[count])
    }

    /// Overwrite the contiguous element slots `[from, to)` from `node`.
    fn write_element_range(
        &mut self,
        pager: &mut Pager,
        loc: NodeLocation,
        node: &Node,
        from: usize,
        to: usize,
    ) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let el_size = ELEMENT_FIXED + self.key_size as usize;
        let mut buf = vec![0u8; (to - from) * el_size];
        for (i, el) in node.elements[from..to].iter().enumerate() {
            el.encode(&mut buf[i * el_size..(i + 1) * el_size]);
        }
        let at = loc.offset + element_offset(from, self.key_size);
        pager.overwrite(self.file_key(loc.file), at, &buf)
    }

    /// Overwrite the contiguous child slots `[from, to)` from `node`.
    fn write_child_range(
        &mut self,
        pager: &mut Pager,
        loc: NodeLocation,
        node: &Node,
        from: usize,
        to: usize,
    ) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let mut buf = vec![0u8; (to - from) * CHILD_SIZE];
        for (i, child) in node.children[from..to].iter().enumerate() {
            child.encode(&mut buf[i * CHILD_SIZE..(i + 1) * CHILD_SIZE]);
        }
        let at = loc.offset + child_offset(from, self.key_size);
        pager.overwrite(self.file_key(loc.file), at, &buf)
    }
}
