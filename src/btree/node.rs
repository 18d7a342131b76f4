//! On-disk B-tree node layout.
//!
//! Every node occupies a fixed-size region of an index file:
//!
//! ```text
//! [count: u8]
//! [element 0] .. [element 63]     each: file u16 | len u32 | pos u32 | key
//! [child 0]   .. [child 64]       each: file u16 | offset u32
//! ```
//!
//! Slots past `count` are zero. A child location of `(0, 0)` means "no
//! child"; no node can live there because file 0 starts with the index
//! header. All integers are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::types::ValueRef;

/// Maximum elements per node.
pub(crate) const ORDER: usize = 64;

/// Elements kept on each side of a split.
pub(crate) const HALF: usize = ORDER / 2;

/// Bytes of an element slot excluding the key.
pub(crate) const ELEMENT_FIXED: usize = 10;

/// Bytes of a child slot.
pub(crate) const CHILD_SIZE: usize = 6;

/// Location of a node within an index's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeLocation {
    /// Index file number (`idx_<id>_<file>.dat`).
    pub(crate) file: u16,
    /// Byte offset of the node within the file.
    pub(crate) offset: u32,
}

impl NodeLocation {
    /// The "no child" sentinel.
    pub(crate) const NONE: NodeLocation = NodeLocation { file: 0, offset: 0 };

    pub(crate) fn is_none(self) -> bool {
        self == NodeLocation::NONE
    }

    pub(crate) fn encode(self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.file);
        LittleEndian::write_u32(&mut buf[2..6], self.offset);
    }

    pub(crate) fn decode(buf: &[u8]) -> NodeLocation {
        NodeLocation {
            file: LittleEndian::read_u16(&buf[0..2]),
            offset: LittleEndian::read_u32(&buf[2..6]),
        }
    }
}

/// One key and its value reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Element {
    /// Where the value lives, or a tombstone length.
    pub(crate) value: ValueRef,
    /// Fixed-size key.
    pub(crate) key: Vec<u8>,
}

impl Element {
    /// Encode the 10 fixed bytes plus the key into `buf`.
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.value.file);
        LittleEndian::write_u32(&mut buf[2..6], self.value.len);
        LittleEndian::write_u32(&mut buf[6..10], self.value.pos);
        buf[10..10 + self.key.len()].copy_from_slice(&self.key);
    }

    pub(crate) fn decode(buf: &[u8], key_size: u8) -> Element {
        Element {
            value: ValueRef {
                file: LittleEndian::read_u16(&buf[0..2]),
                len: LittleEndian::read_u32(&buf[2..6]),
                pos: LittleEndian::read_u32(&buf[6..10]),
            },
            key: buf[ELEMENT_FIXED..ELEMENT_FIXED + key_size as usize].to_vec(),
        }
    }
}

/// Total on-disk size of a node for the given key size.
pub(crate) fn node_len(key_size: u8) -> u32 {
    (1 + ORDER * (ELEMENT_FIXED + key_size as usize) + (ORDER + 1) * CHILD_SIZE) as u32
}

/// Byte offset of element slot `i` within a node.
pub(crate) fn element_offset(i: usize, key_size: u8) -> u32 {
    (1 + i * (ELEMENT_FIXED + key_size as usize)) as u32
}

/// Byte offset of child slot `i` within a node.
pub(crate) fn child_offset(i: usize, key_size: u8) -> u32 {
    (1 + ORDER * (ELEMENT_FIXED + key_size as usize) + i * CHILD_SIZE) as u32
}

/// In-memory copy of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    /// Live elements, `count` of them.
    pub(crate) elements: Vec<Element>,
    /// Child locations, always `count + 1` entries (`NONE` in leaves).
    pub(crate) children: Vec<NodeLocation>,
}

impl Node {
    /// A fresh empty leaf.
    pub(crate) fn empty() -> Node {
        Node { elements: Vec::new(), children: vec![NodeLocation::NONE] }
    }

    pub(crate) fn len(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children[0].is_none()
    }

    /// Binary search for `key` among this node's elements.
    ///
    /// `Ok(i)` is an exact match, `Err(i)` the child index to descend into
    /// (equally the insertion point).
    pub(crate) fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.elements.binary_search_by(|el| el.key.as_slice().cmp(key))
    }

    /// Decode a full node region.
    pub(crate) fn decode(buf: &[u8], key_size: u8) -> Node {
        let count = buf[0] as usize;
        let el_size = ELEMENT_FIXED + key_size as usize;
        let mut elements = Vec::with_capacity(count);
        for i in 0..count {
            let at = 1 + i * el_size;
            elements.push(Element::decode(&buf[at..at + el_size], key_size));
        }
        let mut children = Vec::with_capacity(count + 1);
        let base = 1 + ORDER * el_size;
        for i in 0..=count {
            children.push(NodeLocation::decode(&buf[base + i * CHILD_SIZE..]));
        }
        Node { elements, children }
    }

    /// Encode the full node region, zero-filling unused slots.
    pub(crate) fn encode(&self, key_size: u8) -> Vec<u8> {
        let mut buf = vec![0u8; node_len(key_size) as usize];
        buf[0] = self.elements.len() as u8;
        let el_size = ELEMENT_FIXED + key_size as usize;
        for (i, el) in self.elements.iter().enumerate() {
            let at = 1 + i * el_size;
            el.encode(&mut buf[at..at + el_size]);
        }
        let base = 1 + ORDER * el_size;
        for (i, child) in self.children.iter().enumerate() {
            child.encode(&mut buf[base + i * CHILD_SIZE..base + (i + 1) * CHILD_SIZE]);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(key: &[u8], pos: u32) -> Element {
        Element { value: ValueRef { file: 1, pos, len: 16 }, key: key.to_vec() }
    }

    #[test]
    fn test_node_len_matches_layout() {
        // count + 64 element slots + 65 child slots
        assert_eq!(node_len(8), 1 + 64 * 18 + 65 * 6);
        assert_eq!(child_offset(0, 8), 1 + 64 * 18);
        assert_eq!(element_offset(2, 8), 1 + 2 * 18);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let node = Node {
            elements: vec![element(b"aaaa", 10), element(b"bbbb", 20), element(b"cccc", 30)],
            children: vec![
                NodeLocation { file: 0, offset: 12 },
                NodeLocation { file: 0, offset: 500 },
                NodeLocation { file: 1, offset: 0 },
                NodeLocation { file: 1, offset: 700 },
            ],
        };
        let buf = node.encode(4);
        assert_eq!(buf.len(), node_len(4) as usize);
        let back = Node::decode(&buf, 4);
        assert_eq!(back, node);
        assert!(!back.is_leaf());
    }

    #[test]
    fn test_empty_leaf_round_trip() {
        let node = Node::empty();
        let back = Node::decode(&node.encode(4), 4);
        assert_eq!(back.len(), 0);
        assert!(back.is_leaf());
    }

    #[test]
    fn test_search_positions() {
        let node = Node {
            elements: vec![element(b"bb", 0), element(b"dd", 0), element(b"ff", 0)],
            children: vec![NodeLocation::NONE; 4],
        };
        assert_eq!(node.search(b"dd"), Ok(1));
        assert_eq!(node.search(b"aa"), Err(0));
        assert_eq!(node.search(b"cc"), Err(1));
        assert_eq!(node.search(b"zz"), Err(3));
    }
}
