//! Container adapter: a hierarchical store of groups, datasets and
//! attributes, persisted as a single JSON document.
//!
//! The store is a flat map from absolute paths (`/data/sine`) to nodes.
//! All mutations happen in memory; [`Store::save`] writes the whole tree
//! atomically (temp file + persist) so a crash never leaves a half-written
//! container behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{AttrValue, Value};

/// A node is either a group or a dataset carrying a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Group,
    Dataset(Value),
}

/// One node of the container tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn group() -> Node {
        Node {
            kind: NodeKind::Group,
            attrs: BTreeMap::new(),
        }
    }

    pub fn dataset(value: Value) -> Node {
        Node {
            kind: NodeKind::Dataset(value),
            attrs: BTreeMap::new(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group)
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            NodeKind::Dataset(v) => Some(v),
            NodeKind::Group => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut Value> {
        match &mut self.kind {
            NodeKind::Dataset(v) => Some(v),
            NodeKind::Group => None,
        }
    }
}

/// The whole container tree plus the root attributes.
#[derive(Debug, Serialize, Deserialize)]
pub struct Store {
    pub root_attrs: BTreeMap<String, AttrValue>,
    nodes: BTreeMap<String, Node>,
    #[serde(skip)]
    backing: PathBuf,
}

impl Store {
    /// Fresh, empty store backed by `path`. Nothing is written until `save`.
    pub fn create(path: &Path) -> Store {
        Store {
            root_attrs: BTreeMap::new(),
            nodes: BTreeMap::new(),
            backing: path.to_path_buf(),
        }
    }

    pub fn load(path: &Path) -> Result<Store> {
        let bytes = fs::read(path)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))))?;
        let mut store: Store = serde_json::from_slice(&bytes)?;
        store.backing = path.to_path_buf();
        Ok(store)
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing
    }

    /// Write the tree to its backing file via temp-and-persist.
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.backing)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_vec(self)?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = tempfile::Builder::new()
            .prefix(".ap_tmp")
            .tempfile_in(dir.unwrap_or_else(|| Path::new(".")))?;
        tmp.write_all(&contents)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(path)
    }

    pub fn require(&self, path: &str) -> Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| Error::MissingItem(path.to_string()))
    }

    pub fn require_mut(&mut self, path: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| Error::MissingItem(path.to_string()))
    }

    /// Immediate child names of a group, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut out = Vec::new();
        for key in self.nodes.range(prefix.clone()..) {
            let (k, _) = key;
            if !k.starts_with(&prefix) {
                break;
            }
            let rest = &k[prefix.len()..];
            if !rest.contains('/') {
                out.push(rest.to_string());
            }
        }
        out
    }

    /// Every path in the subtree rooted at `path`, the root included,
    /// in sorted order.
    pub fn subtree(&self, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.nodes.contains_key(path) {
            out.push(path.to_string());
        }
        let prefix = format!("{}/", path);
        for (k, _) in self.nodes.range(prefix.clone()..) {
            if !k.starts_with(&prefix) {
                break;
            }
            out.push(k.clone());
        }
        out
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    fn ensure_parents(&mut self, path: &str) -> Result<()> {
        let mut partial = String::new();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            partial.push('/');
            partial.push_str(segment);
            match self.nodes.get(&partial) {
                None => {
                    self.nodes.insert(partial.clone(), Node::group());
                }
                Some(n) if !n.is_group() => {
                    return Err(Error::Invariant(format!(
                        "{} is a dataset, cannot create children below it",
                        partial
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Create a group, along with any missing intermediate groups.
    pub fn create_group(&mut self, path: &str) -> Result<&mut Node> {
        if self.nodes.contains_key(path) {
            return Err(Error::Invariant(format!("{} already exists", path)));
        }
        self.ensure_parents(path)?;
        self.nodes.insert(path.to_string(), Node::group());
        Ok(self.nodes.get_mut(path).unwrap())
    }

    pub fn require_group(&mut self, path: &str) -> Result<&mut Node> {
        if let Some(node) = self.nodes.get(path) {
            if !node.is_group() {
                return Err(Error::Invariant(format!("{} is not a group", path)));
            }
            return Ok(self.nodes.get_mut(path).unwrap());
        }
        self.create_group(path)
    }

    pub fn create_dataset(&mut self, path: &str, value: Value) -> Result<&mut Node> {
        if self.nodes.contains_key(path) {
            return Err(Error::Invariant(format!("{} already exists", path)));
        }
        self.ensure_parents(path)?;
        self.nodes.insert(path.to_string(), Node::dataset(value));
        Ok(self.nodes.get_mut(path).unwrap())
    }

    /// Create or overwrite the value of a dataset, keeping its attributes.
    pub fn set_dataset(&mut self, path: &str, value: Value) -> Result<&mut Node> {
        match self.nodes.get(path) {
            Some(n) if n.is_group() => Err(Error::Invariant(format!(
                "{} is a group, not a dataset",
                path
            ))),
            Some(_) => {
                let node = self.nodes.get_mut(path).unwrap();
                node.kind = NodeKind::Dataset(value);
                Ok(node)
            }
            None => self.create_dataset(path, value),
        }
    }

    /// Delete a node together with its whole subtree.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(Error::MissingItem(path.to_string()));
        }
        for key in self.subtree(path) {
            self.nodes.remove(&key);
        }
        Ok(())
    }

    /// Deep-copy the subtree under `src_path` in `src` to `dst_path` here.
    /// Attributes are copied verbatim; no provenance rewriting happens at
    /// this level.
    pub fn copy_subtree(&mut self, src: &Store, src_path: &str, dst_path: &str) -> Result<()> {
        let src_node = src.require(src_path)?;
        if self.nodes.contains_key(dst_path) {
            return Err(Error::Invariant(format!("{} already exists", dst_path)));
        }
        self.ensure_parents(dst_path)?;
        self.nodes.insert(dst_path.to_string(), src_node.clone());
        let prefix = format!("{}/", src_path);
        for key in src.subtree(src_path) {
            if key == src_path {
                continue;
            }
            let rel = &key[prefix.len()..];
            let dst_key = format!("{}/{}", dst_path, rel);
            self.nodes.insert(dst_key, src.nodes[&key].clone());
        }
        Ok(())
    }

    /// Clone the full tree (used for snapshots).
    pub fn clone_tree(&self, backing: &Path) -> Store {
        Store {
            root_attrs: self.root_attrs.clone(),
            nodes: self.nodes.clone(),
            backing: backing.to_path_buf(),
        }
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_dataset_makes_intermediate_groups() {
        let mut store = Store::create(Path::new("x.ap"));
        store
            .create_dataset("/data/a/b/c", Value::Int(1))
            .unwrap();
        assert!(store.get("/data").unwrap().is_group());
        assert!(store.get("/data/a/b").unwrap().is_group());
        assert_eq!(store.children("/data/a"), vec!["b".to_string()]);
    }

    #[test]
    fn delete_removes_subtree() {
        let mut store = Store::create(Path::new("x.ap"));
        store.create_dataset("/data/g/one", Value::Int(1)).unwrap();
        store.create_dataset("/data/g/two", Value::Int(2)).unwrap();
        store.delete("/data/g").unwrap();
        assert!(!store.contains("/data/g"));
        assert!(!store.contains("/data/g/one"));
        assert!(store.contains("/data"));
    }

    #[test]
    fn children_does_not_cross_sibling_prefixes() {
        let mut store = Store::create(Path::new("x.ap"));
        store.create_dataset("/data/ab", Value::Int(1)).unwrap();
        store.create_dataset("/data/a/x", Value::Int(2)).unwrap();
        assert_eq!(
            store.children("/data/a"),
            vec!["x".to_string()],
            "prefix scan must not pick up /data/ab"
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.ap");
        let mut store = Store::create(&path);
        store.create_dataset("/data/x", Value::FloatArray(vec![1.0, 2.0])).unwrap();
        store
            .root_attrs
            .insert("DATA_MODEL".into(), AttrValue::Str("active-papers-py".into()));
        store.save().unwrap();
        let loaded = Store::load(&path).unwrap();
        assert_eq!(
            loaded.get("/data/x").unwrap().value(),
            Some(&Value::FloatArray(vec![1.0, 2.0]))
        );
        assert_eq!(
            loaded.root_attrs.get("DATA_MODEL").unwrap().as_str(),
            Some("active-papers-py")
        );
    }
}
