//! # Hierarchical Key-Value Store
//!
//! Values live in a trie keyed by `/`-separated path segments:
//!
//! ```text
//! /<owner>/<seg>/<seg>/<seg>/<seg>
//! ```
//!
//! Keys have 1 to 5 non-empty ASCII alphanumeric segments, a leading slash
//! and no trailing slash. The first segment (root key) names the identity
//! that signed the value; enforcing that is the caller's job.
//!
//! Writes overwrite (last write wins). Removing a key prunes every ancestor
//! that ends up with neither a value nor children.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};

/// Maximum number of path segments in a key.
pub const MAX_KEY_SEGMENTS: usize = 5;

/// A signed record as stored and as carried in `GET_RESP`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KV {
    /// Identity (hex) that signed the value.
    #[serde(rename = "ID")]
    pub id: String,
    pub key: String,
    pub value: String,
    pub sig: String,
}

/// Split a key into its segments, rejecting anything outside
/// `^/([a-zA-Z0-9]+/){0,4}[a-zA-Z0-9]+$`.
pub fn validate_key(key: &str) -> Result<Vec<&str>> {
    let rest = key
        .strip_prefix('/')
        .ok_or_else(|| DhtError::InvalidKey(format!("{:?} must start with '/'", key)))?;

    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() > MAX_KEY_SEGMENTS {
        return Err(DhtError::InvalidKey(format!(
            "{:?} has {} segments (max {})",
            key,
            segments.len(),
            MAX_KEY_SEGMENTS
        )));
    }
    for seg in &segments {
        if seg.is_empty() || !seg.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(DhtError::InvalidKey(format!(
                "{:?} has an empty or non-alphanumeric segment",
                key
            )));
        }
    }
    Ok(segments)
}

/// First segment of a valid key.
pub fn get_root_key(key: &str) -> Result<String> {
    let segments = validate_key(key)?;
    Ok(segments[0].to_string())
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    entry: Option<KV>,
}

impl TrieNode {
    fn is_prunable(&self) -> bool {
        self.entry.is_none() && self.children.is_empty()
    }

    fn collect(&self, out: &mut Vec<KV>) {
        if let Some(kv) = &self.entry {
            out.push(kv.clone());
        }
        for child in self.children.values() {
            child.collect(out);
        }
    }

    fn count(&self) -> usize {
        let own = usize::from(self.entry.is_some());
        own + self.children.values().map(TrieNode::count).sum::<usize>()
    }
}

#[derive(Debug, Default)]
pub struct KvStore {
    root: TrieNode,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: &str, sig: &str, id: &str) -> Result<()> {
        let segments = validate_key(key)?;
        let mut node = &mut self.root;
        for seg in segments {
            node = node.children.entry(seg.to_string()).or_default();
        }
        node.entry = Some(KV {
            id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            sig: sig.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<KV> {
        self.find_node(key)?
            .entry
            .clone()
            .ok_or(DhtError::KeyNotFound)
    }

    /// Every value stored at `prefix` or below it. Order is unspecified.
    pub fn get_all_values_with_prefix(&self, prefix: &str) -> Result<Vec<KV>> {
        let node = self.find_node(prefix)?;
        let mut out = Vec::new();
        node.collect(&mut out);
        Ok(out)
    }

    pub fn remove_key(&mut self, key: &str) -> Result<()> {
        let segments = validate_key(key)?;
        remove_recursive(&mut self.root, &segments)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    fn find_node(&self, key: &str) -> Result<&TrieNode> {
        let segments = validate_key(key)?;
        let mut node = &self.root;
        for seg in segments {
            node = node.children.get(seg).ok_or(DhtError::KeyNotFound)?;
        }
        Ok(node)
    }
}

fn remove_recursive(node: &mut TrieNode, segments: &[&str]) -> Result<()> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(DhtError::KeyNotFound);
    };
    let child = node.children.get_mut(*first).ok_or(DhtError::KeyNotFound)?;

    if rest.is_empty() {
        if child.entry.take().is_none() {
            return Err(DhtError::KeyNotFound);
        }
    } else {
        remove_recursive(child, rest)?;
    }

    if child.is_prunable() {
        node.children.remove(*first);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(mut kvs: Vec<KV>) -> Vec<String> {
        kvs.sort();
        kvs.into_iter().map(|kv| kv.key).collect()
    }

    #[test]
    fn put_then_get_roundtrip() {
        let mut store = KvStore::new();
        store.put("/owner/a/b", "v1", "sig1", "owner").expect("put");
        let kv = store.get("/owner/a/b").expect("get");
        assert_eq!(kv.value, "v1");
        assert_eq!(kv.sig, "sig1");
        assert_eq!(kv.id, "owner");
        assert_eq!(kv.key, "/owner/a/b");
    }

    #[test]
    fn put_overwrites() {
        let mut store = KvStore::new();
        store.put("/o/k", "old", "s1", "o").expect("put");
        store.put("/o/k", "new", "s2", "o").expect("put");
        let kv = store.get("/o/k").expect("get");
        assert_eq!((kv.value.as_str(), kv.sig.as_str()), ("new", "s2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_misses() {
        let mut store = KvStore::new();
        store.put("/o/a/b", "v", "s", "o").expect("put");
        assert!(matches!(store.get("/o/x"), Err(DhtError::KeyNotFound)));
        // internal node without a value
        assert!(matches!(store.get("/o/a"), Err(DhtError::KeyNotFound)));
        assert!(matches!(store.get("bad"), Err(DhtError::InvalidKey(_))));
    }

    #[test]
    fn prefix_query_returns_subtree_only() {
        let mut store = KvStore::new();
        store.put("/o/a", "1", "s", "o").expect("put");
        store.put("/o/a/b", "2", "s", "o").expect("put");
        store.put("/o/a/b/c", "3", "s", "o").expect("put");
        store.put("/o/a/d", "4", "s", "o").expect("put");
        store.put("/o/e", "5", "s", "o").expect("put");
        store.put("/p/a", "6", "s", "p").expect("put");

        let found = store.get_all_values_with_prefix("/o/a").expect("prefix");
        assert_eq!(keys(found), vec!["/o/a", "/o/a/b", "/o/a/b/c", "/o/a/d"]);

        let all_o = store.get_all_values_with_prefix("/o").expect("prefix");
        assert_eq!(all_o.len(), 5);

        assert!(matches!(
            store.get_all_values_with_prefix("/q"),
            Err(DhtError::KeyNotFound)
        ));
    }

    #[test]
    fn remove_leaf_keeps_siblings() {
        let mut store = KvStore::new();
        store.put("/o/a/x", "1", "s", "o").expect("put");
        store.put("/o/a/y", "2", "s", "o").expect("put");
        store.remove_key("/o/a/x").expect("remove");
        assert!(store.get("/o/a/x").is_err());
        assert_eq!(store.get("/o/a/y").expect("sibling").value, "2");
    }

    #[test]
    fn remove_prunes_empty_ancestors() {
        let mut store = KvStore::new();
        store.put("/o/a/b/c", "1", "s", "o").expect("put");
        store.remove_key("/o/a/b/c").expect("remove");
        assert!(store.is_empty());
        assert!(matches!(
            store.get_all_values_with_prefix("/o"),
            Err(DhtError::KeyNotFound)
        ));
    }

    #[test]
    fn remove_stops_at_ancestor_with_value() {
        let mut store = KvStore::new();
        store.put("/o/a", "keep", "s", "o").expect("put");
        store.put("/o/a/b/c", "drop", "s", "o").expect("put");
        store.remove_key("/o/a/b/c").expect("remove");
        assert_eq!(store.get("/o/a").expect("ancestor").value, "keep");
        let rest = store.get_all_values_with_prefix("/o/a").expect("prefix");
        assert_eq!(keys(rest), vec!["/o/a"]);
    }

    #[test]
    fn remove_internal_value_keeps_children() {
        let mut store = KvStore::new();
        store.put("/o/a", "1", "s", "o").expect("put");
        store.put("/o/a/b", "2", "s", "o").expect("put");
        store.remove_key("/o/a").expect("remove");
        assert!(store.get("/o/a").is_err());
        assert_eq!(store.get("/o/a/b").expect("child").value, "2");
    }

    #[test]
    fn remove_missing_key_fails() {
        let mut store = KvStore::new();
        store.put("/o/a/b", "1", "s", "o").expect("put");
        assert!(matches!(store.remove_key("/o/a"), Err(DhtError::KeyNotFound)));
        assert!(matches!(store.remove_key("/o/z"), Err(DhtError::KeyNotFound)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn root_key_extraction() {
        assert_eq!(get_root_key("/key1/key2/key3").expect("root"), "key1");
        assert_eq!(get_root_key("/single").expect("root"), "single");
        assert!(get_root_key("/").is_err());
        assert!(get_root_key("/k1/k2/k3/k4/k5/k6").is_err());
        assert!(get_root_key("/k1/k2/k3/k4/k5").is_ok());
    }

    #[test]
    fn key_syntax_is_exact() {
        for bad in ["", "/", "//", "a/b", "/a/", "/a//b", "/a b", "/a-b", "/a/\n", "/ü"] {
            assert!(validate_key(bad).is_err(), "{:?} should be rejected", bad);
        }
        for good in ["/a", "/A1/b2", "/1/2/3/4/5"] {
            assert!(validate_key(good).is_ok(), "{:?} should be accepted", good);
        }
    }
}
