//! In-order traversal over a B-tree index.
//!
//! A cursor remembers the descent stack of `(location, child index)` pairs,
//! so stepping to the next or previous element never re-descends from the
//! root: it walks down into a subtree or back up to an ancestor, exactly one
//! edge at a time.

use super::node::{Element, NodeLocation};
use super::Index;
use crate::error::Result;
use crate::pager::Pager;

/// Position of one element within the tree.
#[derive(Debug, Clone)]
pub(crate) struct TreeCursor {
    /// Ancestors of the current node, root first, with the child index taken.
    stack: Vec<(NodeLocation, usize)>,
    /// Node holding the current element.
    loc: NodeLocation,
    /// Element index within that node.
    idx: usize,
}

impl TreeCursor {
    /// Position at the first element with key `>= min`, if any.
    pub(crate) fn seek_first(index: &mut Index, pager: &mut Pager, min: &[u8]) -> Result<Option<TreeCursor>> {
        let mut stack = Vec::new();
        let mut loc = index.root();
        loop {
            let node = index.node(pager, loc)?;
            match node.search(min) {
                Ok(i) => return Ok(Some(TreeCursor { stack, loc, idx: i })),
                Err(i) => {
                    if !node.is_leaf() {
                        stack.push((loc, i));
                        loc = node.children[i];
                        continue;
                    }
                    if i < node.len() {
                        return Ok(Some(TreeCursor { stack, loc, idx: i }));
                    }
                    // Ran past the end of a leaf: the successor is the
                    // ancestor element we descended left of, if any.
                    while let Some((parent_loc, child_idx)) = stack.pop() {
                        let parent = index.node(pager, parent_loc)?;
                        if child_idx < parent.len() {
                            return Ok(Some(TreeCursor { stack, loc: parent_loc, idx: child_idx }));
                        }
                    }
                    return Ok(None);
                },
            }
        }
    }

    /// Position at the last element with key `<= max`, if any.
    pub(crate) fn seek_last(index: &mut Index, pager: &mut Pager, max: &[u8]) -> Result<Option<TreeCursor>> {
        let mut stack = Vec::new();
        let mut loc = index.root();
        loop {
            let node = index.node(pager, loc)?;
            match node.search(max) {
                Ok(i) => return Ok(Some(TreeCursor { stack, loc, idx: i })),
                Err(i) => {
                    if !node.is_leaf() {
                        stack.push((loc, i));
                        loc = node.children[i];
                        continue;
                    }
                    if i > 0 {
                        return Ok(Some(TreeCursor { stack, loc, idx: i - 1 }));
                    }
                    while let Some((parent_loc, child_idx)) = stack.pop() {
                        if child_idx > 0 {
                            return Ok(Some(TreeCursor { stack, loc: parent_loc, idx: child_idx - 1 }));
                        }
                    }
                    return Ok(None);
                },
            }
        }
    }

    /// The element currently under the cursor.
    pub(crate) fn element(&self, index: &mut Index, pager: &mut Pager) -> Result<Element> {
        let node = index.node(pager, self.loc)?;
        Ok(node.elements[self.idx].clone())
    }

    /// Step to the in-order successor. Returns `false` when exhausted.
    pub(crate) fn next(&mut self, index: &mut Index, pager: &mut Pager) -> Result<bool> {
        let node = index.node(pager, self.loc)?;
        if !node.is_leaf() {
            // Leftmost element of the right subtree.
            self.stack.push((self.loc, self.idx + 1));
            let mut loc = node.children[self.idx + 1];
            loop {
                let child = index.node(pager, loc)?;
                if child.is_leaf() {
                    self.loc = loc;
                    self.idx = 0;
                    return Ok(true);
                }
                self.stack.push((loc, 0));
                loc = child.children[0];
            }
        }
        if self.idx + 1 < node.len() {
            self.idx += 1;
            return Ok(true);
        }
        while let Some((parent_loc, child_idx)) = self.stack.pop() {
            let parent = index.node(pager, parent_loc)?;
            if child_idx < parent.len() {
                self.loc = parent_loc;
                self.idx = child_idx;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Step to the in-order predecessor. Returns `false` when exhausted.
    pub(crate) fn prev(&mut self, index: &mut Index, pager: &mut Pager) -> Result<bool> {
        let node = index.node(pager, self.loc)?;
        if !node.is_leaf() {
            // Rightmost element of the left subtree.
            self.stack.push((self.loc, self.idx));
            let mut loc = node.children[self.idx];
            loop {
                let child = index.node(pager, loc)?;
                if child.is_leaf() {
                    self.loc = loc;
                    self.idx = child.len() - 1;
                    return Ok(true);
                }
                self.stack.push((loc, child.len()));
                loc = child.children[child.len()];
            }
        }
        if self.idx > 0 {
            self.idx -= 1;
            return Ok(true);
        }
        while let Some((parent_loc, child_idx)) = self.stack.pop() {
            if child_idx > 0 {
                self.loc = parent_loc;
                self.idx = child_idx - 1;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::Element;
    use crate::types::ValueRef;

    fn setup(keys: &[u32]) -> (tempfile::TempDir, Pager, Index) {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::new(dir.path().to_path_buf());
        let mut index = Index::load(&mut pager, 0, 4, 1 << 20).unwrap();
        for (n, key) in keys.iter().enumerate() {
            let path = index.find_with_parents(&mut pager, &key.to_be_bytes()).unwrap();
            let element = Element {
                value: ValueRef { file: 0, pos: n as u32, len: 4 },
                key: key.to_be_bytes().to_vec(),
            };
            index.insert(&mut pager, path, element).unwrap();
        }
        (dir, pager, index)
    }

    fn collect_forward(index: &mut Index, pager: &mut Pager, min: u32, max: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = match TreeCursor::seek_first(index, pager, &min.to_be_bytes()).unwrap() {
            Some(c) => c,
            None => return out,
        };
        loop {
            let el = cursor.element(index, pager).unwrap();
            let key = u32::from_be_bytes(el.key.as_slice().try_into().unwrap());
            if key > max {
                break;
            }
            out.push(key);
            if !cursor.next(index, pager).unwrap() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_forward_iteration_is_sorted_and_complete() {
        // Enough keys to force splits, inserted scrambled.
        let keys: Vec<u32> = (0..1000).map(|n| (n * 37) % 10_000).collect();
        let (_dir, mut pager, mut index) = setup(&keys);
        let got = collect_forward(&mut index, &mut pager, 0, u32::MAX);
        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_forward_iteration_respects_min() {
        let keys: Vec<u32> = (0..100).map(|n| n * 10).collect();
        let (_dir, mut pager, mut index) = setup(&keys);
        // 95 is between elements; iteration starts at 100.
        let got = collect_forward(&mut index, &mut pager, 95, 130);
        assert_eq!(got, vec![100, 110, 120, 130]);
    }

    #[test]
    fn test_seek_past_end_returns_none() {
        let keys: Vec<u32> = (0..50).collect();
        let (_dir, mut pager, mut index) = setup(&keys);
        assert!(TreeCursor::seek_first(&mut index, &mut pager, &1000u32.to_be_bytes())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_empty_tree_seeks_return_none() {
        let (_dir, mut pager, mut index) = setup(&[]);
        assert!(TreeCursor::seek_first(&mut index, &mut pager, &0u32.to_be_bytes())
            .unwrap()
            .is_none());
        assert!(TreeCursor::seek_last(&mut index, &mut pager, &0u32.to_be_bytes())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_backward_iteration() {
        let keys: Vec<u32> = (0..600).map(|n| (n * 13) % 5000).collect();
        let (_dir, mut pager, mut index) = setup(&keys);
        let mut cursor =
            TreeCursor::seek_last(&mut index, &mut pager, &u32::MAX.to_be_bytes()).unwrap().unwrap();
        let mut got = Vec::new();
        loop {
            let el = cursor.element(&mut index, &mut pager).unwrap();
            got.push(u32::from_be_bytes(el.key.as_slice().try_into().unwrap()));
            if !cursor.prev(&mut index, &mut pager).unwrap() {
                break;
            }
        }
        let mut expected = keys.clone();
        expected.sort_unstable();
        expected.reverse();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_seek_last_lands_on_floor_key() {
        let keys: Vec<u32> = (0..100).map(|n| n * 10).collect();
        let (_dir, mut pager, mut index) = setup(&keys);
        let cursor =
            TreeCursor::seek_last(&mut index, &mut pager, &95u32.to_be_bytes()).unwrap().unwrap();
        let el = cursor.element(&mut index, &mut pager).unwrap();
        assert_eq!(u32::from_be_bytes(el.key.as_slice().try_into().unwrap()), 90);
    }
}
