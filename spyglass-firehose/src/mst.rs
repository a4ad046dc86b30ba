//! Read-only traversal of the repository's [merkle search tree].
//!
//! Nodes are looked up in a [`CarIndex`] by CID; keys are reconstructed from
//! the prefix-compressed entries as they are parsed.
//!
//! [merkle search tree]: https://atproto.com/specs/repository#mst-structure

use ipld_core::{cid::Cid, ipld::Ipld};
use serde::{Deserialize, Serialize};

use crate::car::CarIndex;

mod schema {
    use super::*;

    /// The IPLD schema for an MST node.
    #[derive(Deserialize, Serialize, Clone, PartialEq)]
    pub struct Node {
        /// ("left", CID link, nullable): link to a sub-tree [`Node`] on a
        /// lower level whose keys all sort before the keys at this node.
        #[serde(rename = "l")]
        pub left: Option<Cid>,

        /// ("entries", array of objects, required): ordered list of
        /// [`TreeEntry`] objects.
        #[serde(rename = "e")]
        pub entries: Vec<TreeEntry>,
    }

    #[derive(Deserialize, Serialize, Clone, PartialEq)]
    pub struct TreeEntry {
        /// ("prefixlen", integer, required): count of bytes shared with the
        /// previous [`TreeEntry`] in this [`Node`] (if any).
        #[serde(rename = "p")]
        pub prefix_len: usize,

        /// ("keysuffix", byte array, required): remainder of the key for
        /// this [`TreeEntry`], after "prefixlen" bytes have been removed.
        ///
        /// Deserialized via [`Ipld`] so that it maps to a CBOR byte string
        /// (Major Type 2) rather than an array of integers.
        #[serde(rename = "k")]
        pub key_suffix: Ipld,

        /// ("value", CID link, required): link to the record data (CBOR)
        /// for this entry.
        #[serde(rename = "v")]
        pub value: Cid,

        /// ("tree", CID link, nullable): link to a sub-tree [`Node`] at a
        /// lower level which has keys sorting after this entry's key but
        /// before the next entry's key in this [`Node`] (if any).
        #[serde(rename = "t")]
        pub tree: Option<Cid>,
    }
}

/// The location of an entry in a merkle search tree.
#[derive(Debug)]
pub enum Located<E> {
    /// The tree entry corresponding to a key.
    Entry(E),
    /// The CID of the [`Node`] containing the sub-tree in which a key is
    /// located.
    InSubtree(Cid),
}

#[derive(Debug, Clone)]
enum NodeEntry {
    /// A nested node.
    Tree(Cid),
    /// A tree entry.
    Leaf(TreeEntry),
}

impl NodeEntry {
    fn leaf(&self) -> Option<&TreeEntry> {
        match self {
            NodeEntry::Leaf(entry) => Some(entry),
            _ => None,
        }
    }
}

/// A node in a merkle search tree.
///
/// The entry list has the special property that no two `Tree` variants can
/// be adjacent.
#[derive(Debug, Clone)]
pub struct Node {
    entries: Vec<NodeEntry>,
}

impl Node {
    /// Parses an MST node from its DAG-CBOR encoding.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let node: schema::Node = serde_ipld_dagcbor::from_slice(bytes)?;

        let mut entries = vec![];
        if let Some(left) = &node.left {
            entries.push(NodeEntry::Tree(*left));
        }

        let mut prev_key = vec![];
        for entry in &node.entries {
            let parsed_entry = TreeEntry::parse(entry.clone(), &prev_key)?;
            prev_key = parsed_entry.key.as_bytes().to_vec();

            entries.push(NodeEntry::Leaf(parsed_entry));

            // Nested subtrees are located to the right of the entry.
            if let Some(tree) = &entry.tree {
                entries.push(NodeEntry::Tree(*tree));
            }
        }

        Ok(Self { entries })
    }

    /// Find the index of the first leaf that has a key greater than or equal
    /// to the provided key.
    ///
    /// This may return an index equal to the length of `self.entries` (in
    /// other words, OOB). If the node has no leaves, this returns `None`.
    fn find_ge(&self, key: &str) -> Option<usize> {
        let mut e = self.entries.iter().enumerate().filter_map(|(i, e)| e.leaf().map(|e| (i, e)));

        if let Some((i, _e)) = e.find(|(_i, e)| e.key.as_str() >= key) {
            Some(i)
        } else if !self.entries.is_empty() {
            Some(self.entries.len())
        } else {
            None
        }
    }

    /// Finds the location of the given key's value within this sub-tree.
    ///
    /// Returns `None` if the key does not exist within this sub-tree.
    pub fn get(&self, key: &str) -> Option<Located<Cid>> {
        let i = self.find_ge(key)?;

        if let Some(NodeEntry::Leaf(e)) = self.entries.get(i) {
            if e.key == key {
                return Some(Located::Entry(e.value));
            }
        }

        match i.checked_sub(1).and_then(|i| self.entries.get(i)) {
            Some(NodeEntry::Tree(cid)) => Some(Located::InSubtree(*cid)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct TreeEntry {
    key: String,
    value: Cid,
}

impl TreeEntry {
    fn parse(entry: schema::TreeEntry, prev_key: &[u8]) -> Result<Self, Error> {
        let mut key_suffix = match entry.key_suffix {
            Ipld::Bytes(k) => Ok(k),
            _ => Err(Error::KeySuffixNotBytes),
        }?;

        let key = if entry.prefix_len == 0 {
            key_suffix
        } else if prev_key.len() < entry.prefix_len {
            return Err(Error::InvalidPrefixLen);
        } else {
            let mut key_bytes = prev_key[..entry.prefix_len].to_vec();
            key_bytes.append(&mut key_suffix);
            key_bytes
        };

        let key = String::from_utf8(key).map_err(|e| e.utf8_error())?;

        Ok(Self { key, value: entry.value })
    }
}

/// Walks the tree rooted at `root` looking for `key`.
pub fn locate(blocks: &CarIndex, root: Cid, key: &str) -> Result<Option<Cid>, Error> {
    let mut link = root;

    loop {
        let bytes = blocks.get(&link).ok_or(Error::MissingBlock(link))?;
        let node = Node::parse(bytes)?;
        match node.get(key) {
            None => return Ok(None),
            Some(Located::Entry(cid)) => return Ok(Some(cid)),
            Some(Located::InSubtree(cid)) => link = cid,
        }
    }
}

/// Errors that can occur while traversing an MST.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid prefix_len")]
    InvalidPrefixLen,
    #[error("key_suffix not a byte string")]
    KeySuffixNotBytes,
    #[error("node {0} is not present in the block bundle")]
    MissingBlock(Cid),
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] std::str::Utf8Error),
    #[error("serde_ipld_dagcbor decoding error: {0}")]
    Parse(#[from] serde_ipld_dagcbor::DecodeError<std::convert::Infallible>),
}
