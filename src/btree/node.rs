//! B+tree node encoding.
//!
//! Nodes live in fixed size pages of the tree file. A node is either a
//! leaf (sorted key/value entries) or an internal node (separator keys
//! bracketing child page offsets):
//!
//! ```text
//! Leaf     := tag:1 (=1) | keyCount:2 | (key | value)*
//! Internal := tag:1 (=2) | keyCount:2 | key* | childOffset:8 * (keyCount+1)
//! ```
//!
//! Keys and values are self delimiting through their codec traits, so no
//! per-entry length prefixes are needed.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::btree::{Key, Value, PAGE_SIZE};
use crate::errdata;
use crate::error::Result;

const TAG_LEAF: u8 = 1;
const TAG_INTERNAL: u8 = 2;

#[derive(Clone, Debug)]
pub enum Node<K, V> {
    Leaf {
        entries: Vec<(K, V)>,
    },
    Internal {
        keys: Vec<K>,
        children: Vec<u64>,
    },
}

impl<K: Key, V: Value> Node<K, V> {
    /// Encodes the node, failing when it cannot fit a page. The caller
    /// splits and retries in that case.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(256);
        match self {
            Node::Leaf { entries } => {
                buf.push(TAG_LEAF);
                buf.write_u16::<BigEndian>(entries.len() as u16)?;
                for (key, value) in entries {
                    key.encode_into(&mut buf)?;
                    value.encode_into(&mut buf)?;
                }
            }
            Node::Internal { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err(errdata!(
                        "internal node has {} keys but {} children",
                        keys.len(),
                        children.len()
                    ));
                }
                buf.push(TAG_INTERNAL);
                buf.write_u16::<BigEndian>(keys.len() as u16)?;
                for key in keys {
                    key.encode_into(&mut buf)?;
                }
                for child in children {
                    buf.write_u64::<BigEndian>(*child)?;
                }
            }
        }
        if buf.len() > PAGE_SIZE {
            return Err(errdata!(
                "node of {} bytes does not fit a {PAGE_SIZE} byte page",
                buf.len()
            ));
        }
        Ok(buf)
    }

    pub fn decode(page: &[u8]) -> Result<Node<K, V>> {
        let mut reader = page;
        let tag = reader.read_u8()?;
        let count = reader.read_u16::<BigEndian>()? as usize;
        match tag {
            TAG_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = K::decode_from(&mut reader)?;
                    let value = V::decode_from(&mut reader)?;
                    entries.push((key, value));
                }
                Ok(Node::Leaf { entries })
            }
            TAG_INTERNAL => {
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(K::decode_from(&mut reader)?);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..count + 1 {
                    children.push(reader.read_u64::<BigEndian>()?);
                }
                Ok(Node::Internal { keys, children })
            }
            other => Err(errdata!("unknown node tag {other}")),
        }
    }

    /// Index of the child subtree a key belongs to. Separator `keys[i]`
    /// is the smallest key reachable through `children[i + 1]`.
    pub fn child_index(keys: &[K], key: &K) -> usize {
        keys.partition_point(|separator| key >= separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tests_support::{TestKey, TestValue};

    #[test]
    fn test_leaf_roundtrip() {
        let node: Node<TestKey, TestValue> = Node::Leaf {
            entries: vec![
                (TestKey(1), TestValue("one".into())),
                (TestKey(2), TestValue("two".into())),
            ],
        };
        let page = node.encode().unwrap();
        match Node::<TestKey, TestValue>::decode(&page).unwrap() {
            Node::Leaf { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, TestKey(1));
                assert_eq!(entries[1].1, TestValue("two".into()));
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_internal_roundtrip() {
        let node: Node<TestKey, TestValue> = Node::Internal {
            keys: vec![TestKey(10), TestKey(20)],
            children: vec![4096, 8192, 12288],
        };
        let page = node.encode().unwrap();
        match Node::<TestKey, TestValue>::decode(&page).unwrap() {
            Node::Internal { keys, children } => {
                assert_eq!(keys, vec![TestKey(10), TestKey(20)]);
                assert_eq!(children, vec![4096, 8192, 12288]);
            }
            _ => panic!("expected internal"),
        }
    }

    #[test]
    fn test_child_index_brackets() {
        let keys = vec![TestKey(10), TestKey(20)];
        assert_eq!(Node::<TestKey, TestValue>::child_index(&keys, &TestKey(5)), 0);
        assert_eq!(Node::<TestKey, TestValue>::child_index(&keys, &TestKey(10)), 1);
        assert_eq!(Node::<TestKey, TestValue>::child_index(&keys, &TestKey(15)), 1);
        assert_eq!(Node::<TestKey, TestValue>::child_index(&keys, &TestKey(25)), 2);
    }

    #[test]
    fn test_oversized_node_rejected() {
        let big = "x".repeat(PAGE_SIZE);
        let node: Node<TestKey, TestValue> = Node::Leaf {
            entries: vec![(TestKey(1), TestValue(big))],
        };
        assert!(node.encode().is_err());
    }
}
