//! Data views: the wrappers a codelet sees instead of the raw container.
//!
//! Every read through a view records a dependency on the running codelet
//! (or on the nearest enclosing item-marked group), every write stamps the
//! touched item with the codelet's provenance. Views double as the rhai
//! custom types exposed to codelet scripts; the `rhai_*` methods are the
//! script-facing wrappers over the plain Rust operations.

use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult};

use crate::codelet::CodeletState;
use crate::error::{Error, Result};
use crate::library;
use crate::paper::PaperInner;
use crate::paths;
use crate::stamp::{self, StampAttrs};
use crate::value::{AttrValue, Value};

/// Wrapper around a group in `/data` (or `/documentation`).
#[derive(Clone)]
pub struct DataView {
    pub(crate) paper: Arc<PaperInner>,
    pub(crate) path: String,
    pub(crate) section: &'static str,
    pub(crate) codelet: Option<Arc<CodeletState>>,
    /// Nearest enclosing item-marked group, if traversal passed one.
    pub(crate) anchor: Option<String>,
}

/// Wrapper around a dataset.
#[derive(Clone)]
pub struct DatasetView {
    pub(crate) paper: Arc<PaperInner>,
    pub(crate) path: String,
    pub(crate) codelet: Option<Arc<CodeletState>>,
    pub(crate) anchor: Option<String>,
}

/// Result of resolving one path step.
pub enum Resolved {
    Group(DataView),
    Dataset(DatasetView),
}

impl Resolved {
    pub fn into_dynamic(self) -> Dynamic {
        match self {
            Resolved::Group(g) => Dynamic::from(g),
            Resolved::Dataset(d) => Dynamic::from(d),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Resolved::Group(g) => &g.path,
            Resolved::Dataset(d) => &d.path,
        }
    }
}

impl DataView {
    /// View rooted at a section root.
    pub(crate) fn root(
        paper: Arc<PaperInner>,
        section: &'static str,
        codelet: Option<Arc<CodeletState>>,
    ) -> DataView {
        DataView {
            paper,
            path: section.to_string(),
            section,
            codelet,
            anchor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.path
    }

    fn stamp_attrs(&self) -> StampAttrs {
        match &self.codelet {
            Some(c) => c.stamp_attrs(),
            None => StampAttrs::default(),
        }
    }

    /// Stamp after a mutation: the anchor when inside an item-marked group,
    /// the leaf otherwise.
    fn stamp_write(&self, leaf: &str, tag: &str) -> Result<()> {
        let (target, tag) = match &self.anchor {
            Some(anchor) => (anchor.as_str(), "data"),
            None => (leaf, tag),
        };
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(target)?;
            stamp::stamp(node, tag, &self.stamp_attrs())?;
        }
        if let Some(c) = &self.codelet {
            c.note_output(target);
        }
        Ok(())
    }

    /// Resolve one child step, recording dependencies as the spec of the
    /// read path demands.
    fn step(&self, segment: &str) -> Result<Resolved> {
        let child = format!("{}/{}", self.path, segment);
        let (tag, is_group, node_owner, reference) = {
            let store = self.paper.store.lock().unwrap();
            let node = store.require(&child)?;
            let reference = match node.value() {
                Some(Value::Reference { paper_ref, path }) => {
                    Some((paper_ref.clone(), path.clone()))
                }
                _ => None,
            };
            let owner = stamp::owner(node).map(|o| {
                let owner_is_calclet = store
                    .get(o)
                    .map(|n| stamp::datatype(n) == Some("calclet"))
                    .unwrap_or(false);
                (o.to_string(), owner_is_calclet)
            });
            (
                stamp::datatype(node).map(|s| s.to_string()),
                node.is_group(),
                owner,
                reference,
            )
        };

        if tag.as_deref() == Some("reference") {
            let (paper_ref, target) = reference.ok_or_else(|| {
                Error::Format(format!("{}: malformed reference dataset", child))
            })?;
            let (foreign, target) = library::dereference(&paper_ref, &target)?;
            let is_group = {
                let store = foreign.store.lock().unwrap();
                store.require(&target)?.is_group()
            };
            return Ok(if is_group {
                Resolved::Group(DataView {
                    paper: foreign,
                    path: target,
                    section: self.section,
                    codelet: None,
                    anchor: None,
                })
            } else {
                Resolved::Dataset(DatasetView {
                    paper: foreign,
                    path: target,
                    codelet: None,
                    anchor: None,
                })
            });
        }

        if let Some(codelet) = &self.codelet {
            if let Some(tag) = &tag {
                if tag != "group" {
                    let dep = self.anchor.clone().unwrap_or_else(|| child.clone());
                    codelet.add_dependency(&dep);
                }
            }
            // Derived results also depend on the code that made them.
            if let Some((owner, true)) = &node_owner {
                codelet.add_dependency(owner);
            }
        }

        Ok(if is_group {
            let anchor = self.anchor.clone().or_else(|| {
                (tag.as_deref() == Some("data")).then(|| child.clone())
            });
            Resolved::Group(DataView {
                paper: self.paper.clone(),
                path: child,
                section: self.section,
                codelet: self.codelet.clone(),
                anchor,
            })
        } else {
            Resolved::Dataset(DatasetView {
                paper: self.paper.clone(),
                path: child,
                codelet: self.codelet.clone(),
                anchor: self.anchor.clone(),
            })
        })
    }

    /// Resolve a possibly multi-segment user path, recording dependencies
    /// step by step. Absolute paths restart at the section root.
    pub fn lookup(&self, user_path: &str) -> Result<Resolved> {
        let full = paths::resolve_in(&self.path, self.section, user_path)?;
        let (mut view, rel) = if let Some(rest) = full.strip_prefix(&format!("{}/", self.path)) {
            (self.clone(), rest.to_string())
        } else {
            let root = DataView::root(self.paper.clone(), self.section, self.codelet.clone());
            let rel = full
                .strip_prefix(&format!("{}/", self.section))
                .unwrap_or("")
                .to_string();
            (root, rel)
        };
        if rel.is_empty() {
            return Ok(Resolved::Group(view));
        }
        let segments: Vec<&str> = rel.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            match view.step(segment)? {
                Resolved::Group(g) => view = g,
                Resolved::Dataset(d) => {
                    if i + 1 != segments.len() {
                        return Err(Error::MissingItem(format!(
                            "{}/{}",
                            d.path,
                            segments[i + 1..].join("/")
                        )));
                    }
                    return Ok(Resolved::Dataset(d));
                }
            }
        }
        Ok(Resolved::Group(view))
    }

    fn resolve_leaf(&self, user_path: &str) -> Result<String> {
        paths::resolve_in(&self.path, self.section, user_path)
    }

    pub fn create_dataset(&self, user_path: &str, value: Value) -> Result<DatasetView> {
        let leaf = self.resolve_leaf(user_path)?;
        {
            let mut store = self.paper.store.lock().unwrap();
            store.create_dataset(&leaf, value)?;
        }
        self.stamp_write(&leaf, "data")?;
        Ok(DatasetView {
            paper: self.paper.clone(),
            path: leaf,
            codelet: self.codelet.clone(),
            anchor: self.anchor.clone(),
        })
    }

    /// Like `create_dataset` but tolerates an existing dataset, which is
    /// then re-stamped.
    pub fn require_dataset(&self, user_path: &str, value: Value) -> Result<DatasetView> {
        let leaf = self.resolve_leaf(user_path)?;
        let exists = {
            let store = self.paper.store.lock().unwrap();
            match store.get(&leaf) {
                Some(n) if n.is_group() => {
                    return Err(Error::Invariant(format!("{} is a group", leaf)))
                }
                Some(_) => true,
                None => false,
            }
        };
        if !exists {
            let mut store = self.paper.store.lock().unwrap();
            store.create_dataset(&leaf, value)?;
        }
        self.stamp_write(&leaf, "data")?;
        Ok(DatasetView {
            paper: self.paper.clone(),
            path: leaf,
            codelet: self.codelet.clone(),
            anchor: self.anchor.clone(),
        })
    }

    pub fn set_item(&self, user_path: &str, value: Value) -> Result<()> {
        self.create_dataset(user_path, value).map(|_| ())
    }

    pub fn create_group(&self, user_path: &str) -> Result<DataView> {
        let leaf = self.resolve_leaf(user_path)?;
        {
            let mut store = self.paper.store.lock().unwrap();
            store.create_group(&leaf)?;
        }
        self.stamp_write(&leaf, "group")?;
        Ok(DataView {
            paper: self.paper.clone(),
            path: leaf,
            section: self.section,
            codelet: self.codelet.clone(),
            anchor: self.anchor.clone(),
        })
    }

    pub fn require_group(&self, user_path: &str) -> Result<DataView> {
        let leaf = self.resolve_leaf(user_path)?;
        {
            let mut store = self.paper.store.lock().unwrap();
            store.require_group(&leaf)?;
        }
        self.stamp_write(&leaf, "group")?;
        Ok(DataView {
            paper: self.paper.clone(),
            path: leaf,
            section: self.section,
            codelet: self.codelet.clone(),
            anchor: self.anchor.clone(),
        })
    }

    /// Elevate this group to a single dependency unit.
    pub fn mark_as_data_item(&mut self) -> Result<()> {
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(&self.path)?;
            stamp::stamp(node, "data", &self.stamp_attrs())?;
        }
        if let Some(c) = &self.codelet {
            c.note_output(&self.path);
        }
        self.anchor = Some(self.path.clone());
        Ok(())
    }

    /// Delete a child item; only the owning codelet may do this.
    pub fn delete(&self, user_path: &str) -> Result<()> {
        let leaf = self.resolve_leaf(user_path)?;
        let mut store = self.paper.store.lock().unwrap();
        let node = store.require(&leaf)?;
        let allowed = match &self.codelet {
            None => true,
            Some(c) => c.owns(node),
        };
        if !allowed {
            return Err(Error::PermissionDenied(format!(
                "{} trying to remove data created by {}",
                self.codelet.as_ref().map(|c| c.path.as_str()).unwrap_or("?"),
                stamp::owner(node).unwrap_or("<external>")
            )));
        }
        store.delete(&leaf)
    }

    pub fn keys(&self) -> Vec<String> {
        let store = self.paper.store.lock().unwrap();
        store.children(&self.path)
    }

    pub fn contains(&self, name: &str) -> bool {
        match self.resolve_leaf(name) {
            Ok(leaf) => {
                let store = self.paper.store.lock().unwrap();
                store.contains(&leaf)
            }
            Err(_) => false,
        }
    }

    pub fn attrs(&self) -> AttrsView {
        AttrsView {
            paper: self.paper.clone(),
            path: self.path.clone(),
        }
    }

    // ------------------------------------------------------------------
    // rhai-facing wrappers
    // ------------------------------------------------------------------

    pub(crate) fn rhai_index_get(
        &mut self,
        name: &str,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.lookup(name)
            .map(Resolved::into_dynamic)
            .map_err(Error::into_script)
    }

    pub(crate) fn rhai_index_set(
        &mut self,
        name: &str,
        value: Dynamic,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        // Write-back of a view after a method call on an indexed temporary;
        // the view's own operations already hit the store.
        if value.is::<DataView>() || value.is::<DatasetView>() {
            return Ok(());
        }
        let value = Value::from_dynamic(&value)
            .map_err(|m| Error::Format(m).into_script())?;
        self.set_item(name, value).map_err(Error::into_script)
    }

    pub(crate) fn rhai_create_dataset(
        &mut self,
        name: &str,
        value: Dynamic,
    ) -> std::result::Result<DatasetView, Box<EvalAltResult>> {
        let value = Value::from_dynamic(&value)
            .map_err(|m| Error::Format(m).into_script())?;
        self.create_dataset(name, value).map_err(Error::into_script)
    }

    pub(crate) fn rhai_require_dataset(
        &mut self,
        name: &str,
        value: Dynamic,
    ) -> std::result::Result<DatasetView, Box<EvalAltResult>> {
        let value = Value::from_dynamic(&value)
            .map_err(|m| Error::Format(m).into_script())?;
        self.require_dataset(name, value).map_err(Error::into_script)
    }

    pub(crate) fn rhai_create_group(
        &mut self,
        name: &str,
    ) -> std::result::Result<DataView, Box<EvalAltResult>> {
        self.create_group(name).map_err(Error::into_script)
    }

    pub(crate) fn rhai_require_group(
        &mut self,
        name: &str,
    ) -> std::result::Result<DataView, Box<EvalAltResult>> {
        self.require_group(name).map_err(Error::into_script)
    }

    pub(crate) fn rhai_mark_as_data_item(
        &mut self,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.mark_as_data_item().map_err(Error::into_script)
    }

    pub(crate) fn rhai_remove(
        &mut self,
        name: &str,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.delete(name).map_err(Error::into_script)
    }

    pub(crate) fn rhai_keys(&mut self) -> rhai::Array {
        self.keys().into_iter().map(Dynamic::from).collect()
    }

    pub(crate) fn rhai_contains(&mut self, name: &str) -> bool {
        self.contains(name)
    }

    pub(crate) fn rhai_len(&mut self) -> i64 {
        self.keys().len() as i64
    }

    pub(crate) fn rhai_name(&mut self) -> String {
        self.path.clone()
    }

    pub(crate) fn rhai_attrs(&mut self) -> AttrsView {
        self.attrs()
    }

    pub(crate) fn rhai_set_attrs(&mut self, _attrs: AttrsView) {
        // Write-back no-op: attribute mutations go through the store.
    }
}

impl DatasetView {
    pub fn name(&self) -> &str {
        &self.path
    }

    fn stamp_attrs(&self) -> StampAttrs {
        match &self.codelet {
            Some(c) => c.stamp_attrs(),
            None => StampAttrs::default(),
        }
    }

    fn stamp_write(&self) -> Result<()> {
        let target = self.anchor.as_deref().unwrap_or(&self.path);
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(target)?;
            stamp::stamp(node, "data", &self.stamp_attrs())?;
        }
        if let Some(c) = &self.codelet {
            c.note_output(target);
        }
        Ok(())
    }

    pub fn value(&self) -> Result<Value> {
        let store = self.paper.store.lock().unwrap();
        let node = store.require(&self.path)?;
        node.value()
            .cloned()
            .ok_or_else(|| Error::Format(format!("{} is not a dataset", self.path)))
    }

    pub fn set_value(&self, value: Value) -> Result<()> {
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(&self.path)?;
            match node.value_mut() {
                Some(v) => *v = value,
                None => {
                    return Err(Error::Format(format!("{} is not a dataset", self.path)))
                }
            }
        }
        self.stamp_write()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.value()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Grow or shrink an array-valued dataset.
    pub fn resize(&self, new_len: usize) -> Result<()> {
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(&self.path)?;
            match node.value_mut() {
                Some(Value::Bytes(b)) => b.resize(new_len, 0),
                Some(Value::IntArray(v)) => v.resize(new_len, 0),
                Some(Value::FloatArray(v)) => v.resize(new_len, 0.0),
                Some(Value::StrArray(v)) => v.resize(new_len, String::new()),
                _ => {
                    return Err(Error::Format(format!(
                        "{} is not a resizable dataset",
                        self.path
                    )))
                }
            }
        }
        self.stamp_write()
    }

    pub fn attrs(&self) -> AttrsView {
        AttrsView {
            paper: self.paper.clone(),
            path: self.path.clone(),
        }
    }

    // ------------------------------------------------------------------
    // rhai-facing wrappers
    // ------------------------------------------------------------------

    pub(crate) fn rhai_value(&mut self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.value()
            .map(|v| v.to_dynamic())
            .map_err(Error::into_script)
    }

    pub(crate) fn rhai_index_get(
        &mut self,
        index: i64,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let value = self.value().map_err(Error::into_script)?;
        value.element(index as usize).ok_or_else(|| {
            Error::MissingItem(format!("{}[{}]", self.path, index)).into_script()
        })
    }

    pub(crate) fn rhai_index_set(
        &mut self,
        index: i64,
        item: Dynamic,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        let index = index as usize;
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store
                .require_mut(&self.path)
                .map_err(Error::into_script)?;
            let ok = match node.value_mut() {
                Some(Value::IntArray(v)) if index < v.len() => match item.as_int() {
                    Ok(i) => {
                        v[index] = i;
                        true
                    }
                    Err(_) => false,
                },
                Some(Value::FloatArray(v)) if index < v.len() => {
                    match item.as_float().or_else(|_| item.as_int().map(|i| i as f64)) {
                        Ok(f) => {
                            v[index] = f;
                            true
                        }
                        Err(_) => false,
                    }
                }
                Some(Value::Bytes(v)) if index < v.len() => match item.as_int() {
                    Ok(i) => {
                        v[index] = i as u8;
                        true
                    }
                    Err(_) => false,
                },
                Some(Value::StrArray(v)) if index < v.len() => {
                    if item.is_string() {
                        v[index] = item.cast::<String>();
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !ok {
                return Err(Error::Format(format!(
                    "cannot assign element {} of {}",
                    index, self.path
                ))
                .into_script());
            }
        }
        self.stamp_write().map_err(Error::into_script)
    }

    pub(crate) fn rhai_len(&mut self) -> std::result::Result<i64, Box<EvalAltResult>> {
        self.len().map(|l| l as i64).map_err(Error::into_script)
    }

    pub(crate) fn rhai_resize(
        &mut self,
        new_len: i64,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.resize(new_len.max(0) as usize)
            .map_err(Error::into_script)
    }

    pub(crate) fn rhai_write_direct(
        &mut self,
        value: Dynamic,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        let value = Value::from_dynamic(&value)
            .map_err(|m| Error::Format(m).into_script())?;
        self.set_value(value).map_err(Error::into_script)
    }

    pub(crate) fn rhai_name(&mut self) -> String {
        self.path.clone()
    }

    pub(crate) fn rhai_attrs(&mut self) -> AttrsView {
        self.attrs()
    }

    pub(crate) fn rhai_set_attrs(&mut self, _attrs: AttrsView) {
        // Write-back no-op: attribute mutations go through the store.
    }
}

/// Attribute access with the reserved prefix hidden.
#[derive(Clone)]
pub struct AttrsView {
    pub(crate) paper: Arc<PaperInner>,
    pub(crate) path: String,
}

impl AttrsView {
    pub fn get(&self, name: &str) -> Result<AttrValue> {
        if stamp::is_reserved(name) {
            return Err(Error::MissingItem(format!("attribute {}", name)));
        }
        let store = self.paper.store.lock().unwrap();
        let node = store.require(&self.path)?;
        node.attrs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingItem(format!("attribute {}", name)))
    }

    pub fn set(&self, name: &str, value: AttrValue) -> Result<()> {
        if stamp::is_reserved(name) {
            return Err(Error::PermissionDenied(format!(
                "attribute {} is reserved",
                name
            )));
        }
        let mut store = self.paper.store.lock().unwrap();
        let node = store.require_mut(&self.path)?;
        node.attrs.insert(name.to_string(), value);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        if stamp::is_reserved(name) {
            return Err(Error::MissingItem(format!("attribute {}", name)));
        }
        let mut store = self.paper.store.lock().unwrap();
        let node = store.require_mut(&self.path)?;
        node.attrs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::MissingItem(format!("attribute {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        if stamp::is_reserved(name) {
            return false;
        }
        let store = self.paper.store.lock().unwrap();
        store
            .get(&self.path)
            .map(|n| n.attrs.contains_key(name))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        let store = self.paper.store.lock().unwrap();
        store
            .get(&self.path)
            .map(|n| {
                n.attrs
                    .keys()
                    .filter(|k| !stamp::is_reserved(k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // rhai-facing wrappers
    // ------------------------------------------------------------------

    pub(crate) fn rhai_index_get(
        &mut self,
        name: &str,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.get(name)
            .map(|a| a.to_dynamic())
            .map_err(Error::into_script)
    }

    pub(crate) fn rhai_index_set(
        &mut self,
        name: &str,
        value: Dynamic,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        let value = AttrValue::from_dynamic(&value)
            .map_err(|m| Error::Format(m).into_script())?;
        self.set(name, value).map_err(Error::into_script)
    }

    pub(crate) fn rhai_remove(
        &mut self,
        name: &str,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.remove(name).map_err(Error::into_script)
    }

    pub(crate) fn rhai_contains(&mut self, name: &str) -> bool {
        self.contains(name)
    }

    pub(crate) fn rhai_keys(&mut self) -> rhai::Array {
        self.keys().into_iter().map(Dynamic::from).collect()
    }

    pub(crate) fn rhai_len(&mut self) -> i64 {
        self.keys().len() as i64
    }
}
