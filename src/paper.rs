//! The paper container: lifecycle, item management, provenance queries,
//! rebuild and snapshot.
//!
//! `ActivePaper` is the only type client code needs. It owns the container
//! store, creates codelets, answers dependency-graph queries and drives
//! deterministic re-execution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rhai::{Module, Shared};

use crate::code::CodeView;
use crate::codelet::{self, Codelet, Creator};
use crate::error::{Error, Result};
use crate::graph;
use crate::internal_file::{Encoding, InternalFile, OpenMode};
use crate::library;
use crate::modules;
use crate::paths;
use crate::registry;
use crate::stamp::{self, StampAttrs};
use crate::store::Store;
use crate::value::{AttrValue, HistoryEntry, Value};
use crate::views::DataView;

pub const DATA_MODEL: &str = "active-papers-py";
pub const DATA_MODEL_MAJOR_VERSION: i64 = 0;
pub const DATA_MODEL_MINOR_VERSION: i64 = 1;

const README_TEXT: &str = "\
This file is an ActivePaper.

Code, data and documentation live together in this container; every
derived item records the codelets and data it was computed from, so the
whole artifact can be rebuilt from its primary inputs.

For more information about ActivePapers see:

  http://www.activepapers.org/
";

/// Shared state behind every handle to one open paper.
pub struct PaperInner {
    pub(crate) id: String,
    pub(crate) filename: PathBuf,
    pub(crate) writable: bool,
    pub(crate) open: AtomicBool,
    pub(crate) store: Mutex<Store>,
    /// Declared external packages from `/external-dependencies`.
    pub(crate) packages: Vec<String>,
    /// Modules loaded out of this paper, keyed by import name.
    pub(crate) local_modules: Mutex<HashMap<String, Shared<Module>>>,
}

impl Drop for PaperInner {
    fn drop(&mut self) {
        if self.open.load(Ordering::SeqCst) && self.writable {
            if let Err(e) = finish_history_and_save(self) {
                tracing::warn!(
                    target: "activepapers::paper",
                    "close of {} failed: {}",
                    self.filename.display(),
                    e
                );
            }
        }
    }
}

fn finish_history_and_save(inner: &PaperInner) -> Result<()> {
    let mut store = inner.store.lock().unwrap();
    if let Some(node) = store.get_mut("/history") {
        if let Some(Value::History(entries)) = node.value_mut() {
            if let Some(last) = entries.last_mut() {
                if last.closed == 0 {
                    last.closed = stamp::ms_since_epoch();
                }
            }
        }
    }
    store.save()
}

fn component_versions(packages: &[String]) -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    versions.insert("activepapers".to_string(), env!("CARGO_PKG_VERSION").to_string());
    for name in packages {
        versions.insert(
            name.clone(),
            modules::host_package_version(name).unwrap_or_else(|| "unknown".to_string()),
        );
    }
    versions
}

fn new_history_entry(packages: &[String]) -> HistoryEntry {
    HistoryEntry {
        opened: stamp::ms_since_epoch(),
        closed: 0,
        platform: std::env::consts::OS.to_string(),
        hostname: std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "localhost".to_string()),
        username: std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string()),
        versions: component_versions(packages),
    }
}

fn verify_packages(packages: &[String]) -> Result<()> {
    for name in packages {
        if modules::builtin_module(name).is_none() && !modules::have_host_package(name) {
            return Err(Error::Format(format!(
                "declared external package {} is not registered in this process",
                name
            )));
        }
    }
    Ok(())
}

/// A research artifact container.
///
/// Handles are cheap to clone; the underlying paper closes when `close`
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct ActivePaper {
    pub(crate) inner: Arc<PaperInner>,
}

impl ActivePaper {
    pub(crate) fn from_inner(inner: Arc<PaperInner>) -> ActivePaper {
        ActivePaper { inner }
    }

    pub(crate) fn inner_arc(&self) -> &Arc<PaperInner> {
        &self.inner
    }

    /// Create a fresh paper at `filename`, declaring the external packages
    /// it depends on. Each declared package must be registered in the host
    /// process.
    pub fn create(filename: &Path, packages: &[String]) -> Result<ActivePaper> {
        verify_packages(packages)?;
        let mut store = Store::create(filename);
        store
            .root_attrs
            .insert("DATA_MODEL".into(), AttrValue::Str(DATA_MODEL.into()));
        store.root_attrs.insert(
            "DATA_MODEL_MAJOR_VERSION".into(),
            AttrValue::Int(DATA_MODEL_MAJOR_VERSION),
        );
        store.root_attrs.insert(
            "DATA_MODEL_MINOR_VERSION".into(),
            AttrValue::Int(DATA_MODEL_MINOR_VERSION),
        );
        for section in paths::SECTIONS {
            store.create_group(section)?;
        }
        store.create_group("/external-dependencies")?;
        store.create_dataset(
            "/external-dependencies/python-packages",
            Value::StrArray(packages.to_vec()),
        )?;
        store.create_dataset("/README", Value::Str(README_TEXT.to_string()))?;
        store.create_dataset(
            "/history",
            Value::History(vec![new_history_entry(packages)]),
        )?;
        store.save()?;

        let inner = Arc::new(PaperInner {
            id: uuid::Uuid::new_v4().simple().to_string(),
            filename: filename.to_path_buf(),
            writable: true,
            open: AtomicBool::new(true),
            store: Mutex::new(store),
            packages: packages.to_vec(),
            local_modules: Mutex::new(HashMap::new()),
        });
        registry::register_paper(&inner.id, &inner);
        Ok(ActivePaper { inner })
    }

    /// Open an existing paper. Modes: `"r"` read-only, `"r+"` read-write,
    /// `"w"` create/truncate.
    pub fn open(filename: &Path, mode: &str) -> Result<ActivePaper> {
        match mode {
            "w" => return ActivePaper::create(filename, &[]),
            "r" | "r+" => {}
            other => return Err(Error::Format(format!("unknown open mode {}", other))),
        }
        let writable = mode == "r+";
        let mut store = Store::load(filename)?;
        match store.root_attrs.get("DATA_MODEL").and_then(|a| a.as_str()) {
            Some(model) if model == DATA_MODEL => {}
            _ => {
                return Err(Error::Format(format!(
                    "{} is not an ActivePaper",
                    filename.display()
                )))
            }
        }
        match store
            .root_attrs
            .get("DATA_MODEL_MAJOR_VERSION")
            .and_then(|a| a.as_i64())
        {
            Some(v) if v == DATA_MODEL_MAJOR_VERSION => {}
            v => {
                return Err(Error::Format(format!(
                    "unsupported data model version {:?}",
                    v
                )))
            }
        }
        let packages = store
            .get("/external-dependencies/python-packages")
            .and_then(|n| match n.value() {
                Some(Value::StrArray(list)) => Some(list.clone()),
                _ => None,
            })
            .unwrap_or_default();
        verify_packages(&packages)?;
        if writable {
            if let Some(node) = store.get_mut("/history") {
                if let Some(Value::History(entries)) = node.value_mut() {
                    entries.push(new_history_entry(&packages));
                }
            }
            store.save()?;
        }
        let inner = Arc::new(PaperInner {
            id: uuid::Uuid::new_v4().simple().to_string(),
            filename: filename.to_path_buf(),
            writable,
            open: AtomicBool::new(true),
            store: Mutex::new(store),
            packages,
            local_modules: Mutex::new(HashMap::new()),
        });
        registry::register_paper(&inner.id, &inner);
        Ok(ActivePaper { inner })
    }

    pub fn filename(&self) -> &Path {
        &self.inner.filename
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn packages(&self) -> &[String] {
        &self.inner.packages
    }

    fn assert_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Format(format!(
                "{} has been closed",
                self.inner.filename.display()
            )));
        }
        Ok(())
    }

    fn assert_writable(&self) -> Result<()> {
        self.assert_open()?;
        if !self.inner.writable {
            return Err(Error::PermissionDenied(format!(
                "{} is open read-only",
                self.inner.filename.display()
            )));
        }
        Ok(())
    }

    /// Flush the in-memory tree to disk.
    pub fn flush(&self) -> Result<()> {
        self.assert_writable()?;
        self.inner.store.lock().unwrap().save()
    }

    /// Close the paper: finish the history entry, write the file, drop the
    /// registry entry. Further operations fail.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let result = if self.inner.writable {
            finish_history_and_save(&self.inner)
        } else {
            Ok(())
        };
        self.inner.local_modules.lock().unwrap().clear();
        self.inner.open.store(false, Ordering::SeqCst);
        registry::unregister_paper(&self.inner.id);
        result
    }

    // ------------------------------------------------------------------
    // Views and direct data access (external pseudo-owner)
    // ------------------------------------------------------------------

    /// View over `/data` for code running outside any codelet.
    pub fn data(&self) -> DataView {
        DataView::root(self.inner.clone(), paths::DATA_SECTION, None)
    }

    /// Read-only view over `/code`.
    pub fn code(&self) -> CodeView {
        CodeView::root(self.inner.clone())
    }

    /// Create a primary-input dataset under `/data`.
    pub fn set_data(&self, path: &str, value: Value) -> Result<()> {
        self.assert_writable()?;
        self.data().set_item(path, value)
    }

    /// Raw value of any dataset in the container.
    pub fn get_value(&self, path: &str) -> Result<Value> {
        self.assert_open()?;
        let store = self.inner.store.lock().unwrap();
        let node = store.require(path)?;
        node.value()
            .cloned()
            .ok_or_else(|| Error::Format(format!("{} is a group", path)))
    }

    /// Create a structural group (CLI `group` command).
    pub fn create_group(&self, path: &str) -> Result<()> {
        self.assert_writable()?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        if paths::section_of(&path).is_none() {
            return Err(Error::Format(format!("invalid group name {}", path)));
        }
        self.inner.store.lock().unwrap().create_group(&path)?;
        Ok(())
    }

    /// Delete any node, no ownership check (external code owns everything).
    pub fn delete_item(&self, path: &str) -> Result<()> {
        self.assert_writable()?;
        self.inner.store.lock().unwrap().delete(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.store.lock().unwrap().contains(path)
    }

    // ------------------------------------------------------------------
    // Code storage
    // ------------------------------------------------------------------

    pub(crate) fn store_script(&self, path: &str, text: &str, tag: &str) -> Result<String> {
        self.assert_writable()?;
        let abs = paths::codepath(path)?;
        let mut store = self.inner.store.lock().unwrap();
        let node = store.set_dataset(&abs, Value::Str(text.to_string()))?;
        node.attrs
            .insert(stamp::ATTR_LANGUAGE.into(), AttrValue::Str("rhai".into()));
        stamp::stamp(node, tag, &StampAttrs::default())?;
        Ok(abs)
    }

    pub fn create_calclet(&self, path: &str, script: &str) -> Result<Codelet> {
        let abs = self.store_script(path, script, "calclet")?;
        Ok(Codelet {
            paper: self.inner.clone(),
            path: abs,
        })
    }

    pub fn create_importlet(&self, path: &str, script: &str) -> Result<Codelet> {
        let abs = self.store_script(path, script, "importlet")?;
        Ok(Codelet {
            paper: self.inner.clone(),
            path: abs,
        })
    }

    /// Store module source under `/code/python-packages`, dotted names
    /// becoming nested groups.
    pub fn add_module(&self, name: &str, text: &str) -> Result<()> {
        let segments = paths::module_segments(name);
        if segments.is_empty() {
            return Err(Error::Format(format!("invalid module name {}", name)));
        }
        let rel = format!("python-packages/{}", segments.join("/"));
        let abs = self.store_script(&rel, text, "module")?;
        debug_assert!(abs.starts_with(modules::PACKAGE_GROUP));
        Ok(())
    }

    /// Import module source from the host file system: `<name>.rhai`, or a
    /// package directory with an `__init__.rhai`. Parent packages of a
    /// dotted name are imported first.
    pub fn import_module(&self, name: &str, search: &[PathBuf]) -> Result<()> {
        if let Some((package, _)) = name.rsplit_once('.') {
            self.import_module(package, search)?;
        }
        let rel: PathBuf = name.split('.').collect();
        for root in search {
            let as_file = root.join(&rel).with_extension("rhai");
            if as_file.is_file() {
                let text = std::fs::read_to_string(&as_file)?;
                return self.add_module(name, &text);
            }
            let as_package = root.join(&rel).join("__init__.rhai");
            if as_package.is_file() {
                let text = std::fs::read_to_string(&as_package)?;
                return self.add_module(&format!("{}.__init__", name), &text);
            }
        }
        Err(Error::MissingItem(format!(
            "module {} not found on the search path",
            name
        )))
    }

    /// Container path of a module stored in this paper, if present.
    pub fn get_local_module(&self, name: &str) -> Option<String> {
        let segments = paths::module_segments(name);
        if segments.is_empty() {
            return None;
        }
        let path = format!("{}/{}", modules::PACKAGE_GROUP, segments.join("/"));
        self.contains(&path).then_some(path)
    }

    // ------------------------------------------------------------------
    // References and copies
    // ------------------------------------------------------------------

    fn create_ref_in(
        &self,
        section: Option<&'static str>,
        path: &str,
        paper_ref: &str,
        ref_path: Option<&str>,
    ) -> Result<()> {
        self.assert_writable()?;
        let target_rel = ref_path.unwrap_or(path);
        let (local, target) = match section {
            Some(section) => (
                paths::in_section(section, path)?,
                paths::in_section(section, target_rel)?,
            ),
            None => {
                let absolutize = |p: &str| {
                    if p.starts_with('/') {
                        p.to_string()
                    } else {
                        format!("/{}", p)
                    }
                };
                (absolutize(path), absolutize(target_rel))
            }
        };
        // Resolving the reference verifies that the target exists.
        library::dereference(paper_ref, &target)?;
        let mut store = self.inner.store.lock().unwrap();
        let node = store.set_dataset(
            &local,
            Value::Reference {
                paper_ref: paper_ref.to_string(),
                path: target,
            },
        )?;
        stamp::stamp(node, "reference", &StampAttrs::default())?;
        Ok(())
    }

    pub fn create_ref(&self, path: &str, paper_ref: &str, ref_path: Option<&str>) -> Result<()> {
        self.create_ref_in(None, path, paper_ref, ref_path)
    }

    pub fn create_data_ref(
        &self,
        path: &str,
        paper_ref: &str,
        ref_path: Option<&str>,
    ) -> Result<()> {
        self.create_ref_in(Some(paths::DATA_SECTION), path, paper_ref, ref_path)
    }

    pub fn create_code_ref(
        &self,
        path: &str,
        paper_ref: &str,
        ref_path: Option<&str>,
    ) -> Result<()> {
        self.create_ref_in(Some(paths::CODE_SECTION), path, paper_ref, ref_path)
    }

    pub fn create_module_ref(
        &self,
        path: &str,
        paper_ref: &str,
        ref_path: Option<&str>,
    ) -> Result<()> {
        let path = format!("python-packages/{}", path);
        let ref_path = ref_path.map(|p| format!("python-packages/{}", p));
        self.create_ref_in(
            Some(paths::CODE_SECTION),
            &path,
            paper_ref,
            ref_path.as_deref(),
        )
    }

    /// Deep-copy an item from another paper. The copy becomes a primary
    /// input: its provenance attributes are stripped, its timestamp is the
    /// source's, and a `copied-from` attribute records the origin.
    pub fn create_copy(&self, path: &str, paper_ref: &str, ref_path: Option<&str>) -> Result<()> {
        self.assert_writable()?;
        let local = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let target = {
            let t = ref_path.unwrap_or(&local);
            if t.starts_with('/') {
                t.to_string()
            } else {
                format!("/{}", t)
            }
        };
        let source = library::open_paper_ref(paper_ref)?;
        if Arc::ptr_eq(&source.inner, &self.inner) {
            return Err(Error::Reference(format!(
                "{} resolves to this paper itself",
                paper_ref
            )));
        }
        let source_store = source.inner.store.lock().unwrap();
        let source_time = stamp::mod_time(source_store.require(&target)?);
        let mut store = self.inner.store.lock().unwrap();
        store.copy_subtree(&source_store, &target, &local)?;
        for copied in store.subtree(&local) {
            let node = store.get_mut(&copied).unwrap();
            stamp::strip_provenance(node);
        }
        let root = store.require_mut(&local)?;
        stamp::timestamp(root, source_time);
        root.attrs.insert(
            stamp::ATTR_COPIED_FROM.into(),
            AttrValue::RefPair {
                paper_ref: paper_ref.to_string(),
                path: target,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dummies
    // ------------------------------------------------------------------

    /// Replace a derived item by a zero-sized placeholder that keeps its
    /// provenance. Primary inputs cannot be dummied.
    pub fn replace_by_dummy(&self, path: &str) -> Result<()> {
        self.assert_writable()?;
        let mut store = self.inner.store.lock().unwrap();
        let node = store.require(path)?;
        let codelet = stamp::owner(node)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Invariant(format!("{} is a primary input, cannot dummy it", path))
            })?;
        let tag = stamp::datatype(node).unwrap_or("data").to_string();
        let time = stamp::mod_time(node);
        let deps = stamp::dependencies(node);
        store.delete(path)?;
        let new_node = store.create_dataset(path, Value::Bytes(Vec::new()))?;
        stamp::stamp(
            new_node,
            &tag,
            &StampAttrs {
                generating_codelet: Some(codelet),
                dependencies: Some(deps),
            },
        )?;
        stamp::timestamp(new_node, time);
        new_node
            .attrs
            .insert(stamp::ATTR_DUMMY.into(), AttrValue::Bool(true));
        Ok(())
    }

    pub fn is_dummy(&self, path: &str) -> bool {
        let store = self.inner.store.lock().unwrap();
        store.get(path).map(stamp::is_dummy).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Item enumeration and provenance queries
    // ------------------------------------------------------------------

    /// All items: non-group nodes plus item-marked groups, whose subtrees
    /// are treated as opaque.
    pub fn iter_items(&self) -> Vec<String> {
        let store = self.inner.store.lock().unwrap();
        let mut out = Vec::new();
        for section in paths::SECTIONS {
            walk_items(&store, section, &mut out);
        }
        out
    }

    /// All structural groups (groups not elevated to items).
    pub fn iter_groups(&self) -> Vec<String> {
        let store = self.inner.store.lock().unwrap();
        let mut out = Vec::new();
        for section in paths::SECTIONS {
            walk_groups(&store, section, &mut out);
        }
        out
    }

    pub fn datatype_of(&self, path: &str) -> Option<String> {
        let store = self.inner.store.lock().unwrap();
        store.get(path).and_then(|n| stamp::datatype(n).map(str::to_string))
    }

    pub fn timestamp_of(&self, path: &str) -> Option<i64> {
        let store = self.inner.store.lock().unwrap();
        store.get(path).and_then(stamp::mod_time)
    }

    pub fn generating_codelet(&self, path: &str) -> Option<String> {
        let store = self.inner.store.lock().unwrap();
        store.get(path).and_then(|n| stamp::owner(n).map(str::to_string))
    }

    pub fn language_of(&self, path: &str) -> Option<String> {
        let store = self.inner.store.lock().unwrap();
        store.get(path).and_then(|n| stamp::language(n).map(str::to_string))
    }

    /// The dependency list recorded on an item.
    pub fn iter_dependencies(&self, path: &str) -> Vec<String> {
        let store = self.inner.store.lock().unwrap();
        store.get(path).map(stamp::dependencies).unwrap_or_default()
    }

    pub fn has_dependencies(&self, path: &str) -> bool {
        !self.iter_dependencies(path).is_empty()
    }

    /// An item is stale when any of its dependencies is newer.
    pub fn is_stale(&self, path: &str) -> bool {
        let store = self.inner.store.lock().unwrap();
        let node = match store.get(path) {
            Some(n) => n,
            None => return false,
        };
        let time = match stamp::mod_time(node) {
            Some(t) => t,
            None => return false,
        };
        stamp::dependencies(node).iter().any(|dep| {
            store
                .get(dep)
                .and_then(stamp::mod_time)
                .map(|dep_time| dep_time > time)
                .unwrap_or(false)
        })
    }

    /// Every calclet in the paper, by path.
    pub fn calclets(&self) -> BTreeMap<String, Codelet> {
        self.iter_items()
            .into_iter()
            .filter(|p| self.datatype_of(p).as_deref() == Some("calclet"))
            .map(|p| {
                (
                    p.clone(),
                    Codelet {
                        paper: self.inner.clone(),
                        path: p,
                    },
                )
            })
            .collect()
    }

    /// Map each name to the set of names depending on it (items and
    /// structural groups included).
    pub fn dependency_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in self.iter_items().into_iter().chain(self.iter_groups()) {
            deps.insert(name.clone(), self.iter_dependencies(&name));
        }
        graph::transpose(&deps)
    }

    /// Topological layering of the items: each layer depends only on
    /// earlier layers, the first layer being the primary inputs.
    pub fn dependency_hierarchy(&self) -> Result<Vec<BTreeSet<String>>> {
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in self.iter_items() {
            deps.insert(name.clone(), self.iter_dependencies(&name));
        }
        graph::layered(&deps)
    }

    /// Labels of all foreign papers this one references or copied from,
    /// with the referenced and copied paths.
    pub fn external_references(
        &self,
    ) -> BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> {
        let store = self.inner.store.lock().unwrap();
        let mut refs: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
        for path in store.all_paths() {
            if paths::section_of(path).is_none() {
                continue;
            }
            let node = store.get(path).unwrap();
            if stamp::datatype(node) == Some("reference") {
                if let Some(Value::Reference { paper_ref, path }) = node.value() {
                    refs.entry(paper_ref.clone())
                        .or_default()
                        .0
                        .insert(path.clone());
                }
            }
            if let Some(AttrValue::RefPair { paper_ref, path }) =
                node.attrs.get(stamp::ATTR_COPIED_FROM)
            {
                refs.entry(paper_ref.clone())
                    .or_default()
                    .1
                    .insert(path.clone());
            }
        }
        refs
    }

    // ------------------------------------------------------------------
    // Codelet execution, rebuild, snapshot
    // ------------------------------------------------------------------

    /// Run a stored codelet. `Ok(Some(text))` carries a captured traceback;
    /// with `debug` the failure is returned as an error instead.
    pub fn run_codelet(&self, path: &str, debug: bool) -> Result<Option<String>> {
        self.assert_writable()?;
        codelet::run(&self.inner, path, debug)
    }

    /// Rebuild the paper into a fresh container at `target`: copy the
    /// primary inputs with their timestamps, then run each generating
    /// codelet exactly once in dependency order.
    pub fn rebuild(&self, target: &Path) -> Result<()> {
        self.assert_open()?;
        let layers = self.dependency_hierarchy()?;
        let clone = ActivePaper::create(target, &self.inner.packages)?;
        {
            let source = self.inner.store.lock().unwrap();
            let mut dest = clone.inner.store.lock().unwrap();
            if let Some(first) = layers.first() {
                for item in first {
                    dest.copy_subtree(&source, item, item)?;
                }
            }
        }
        let mut ran: BTreeSet<String> = BTreeSet::new();
        for layer in layers.iter().skip(1) {
            let mut codelets: BTreeSet<String> = BTreeSet::new();
            for item in layer {
                if let Some(codelet) = self.generating_codelet(item) {
                    codelets.insert(codelet);
                }
            }
            for codelet in codelets {
                if !ran.insert(codelet.clone()) {
                    continue;
                }
                if let Some(traceback) = clone.run_codelet(&codelet, false)? {
                    return Err(Error::CodeletFailed(traceback));
                }
            }
        }
        clone.close()
    }

    /// Point-in-time copy of the whole container, meant to be called from
    /// long-running codelets to expose partial progress.
    pub fn snapshot(&self, target: &Path) -> Result<()> {
        self.assert_open()?;
        snapshot_impl(&self.inner, target)
    }

    // ------------------------------------------------------------------
    // Internal files
    // ------------------------------------------------------------------

    /// Open a byte-stream file in `/data` or `/documentation`, applying
    /// the ownership rules for overwrites.
    pub fn open_internal_file(
        &self,
        path: &str,
        mode: &str,
        encoding: Option<Encoding>,
    ) -> Result<InternalFile> {
        self.assert_open()?;
        let abs = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        open_internal_file_impl(&self.inner, &abs, mode, encoding, Creator::External)
    }
}

// ----------------------------------------------------------------------
// Crate-internal operations shared with the codelet runtime
// ----------------------------------------------------------------------

pub(crate) fn snapshot_impl(inner: &Arc<PaperInner>, target: &Path) -> Result<()> {
    let store = inner.store.lock().unwrap();
    if inner.writable {
        store.save()?;
    }
    store.save_to(target)
}

pub(crate) fn open_internal_file_impl(
    inner: &Arc<PaperInner>,
    abs: &str,
    mode: &str,
    encoding: Option<Encoding>,
    creator: Creator,
) -> Result<InternalFile> {
    match paths::section_of(abs) {
        Some(paths::DATA_SECTION) | Some(paths::DOCUMENTATION_SECTION) => {}
        _ => return Err(Error::PermissionDenied(abs.to_string())),
    }
    let (open_mode, binary) = OpenMode::parse(mode)?;
    {
        let mut store = inner.store.lock().unwrap();
        match open_mode {
            OpenMode::Read | OpenMode::Append => {
                store.require(abs)?;
            }
            OpenMode::Write => {
                if let Some(existing) = store.get(abs) {
                    if !creator.owns(existing) {
                        return Err(Error::PermissionDenied(format!(
                            "{} trying to overwrite data created by {}",
                            creator.path().unwrap_or("<external>"),
                            stamp::owner(existing).unwrap_or("<external>")
                        )));
                    }
                    store.delete(abs)?;
                }
                store.create_dataset(abs, Value::Bytes(Vec::new()))?;
            }
        }
    }
    InternalFile::new(
        inner.clone(),
        abs.to_string(),
        open_mode,
        binary,
        encoding,
        creator,
    )
}

/// Delete everything a codelet generated before re-running it. Groups
/// elevated to data items that the codelet does not own are left alone as
/// a whole; structural groups are never deleted themselves.
pub(crate) fn remove_owned_by(inner: &Arc<PaperInner>, codelet: &str) -> Result<()> {
    let mut store = inner.store.lock().unwrap();
    let mut victims: Vec<String> = Vec::new();
    for section in paths::SECTIONS {
        collect_owned(&store, section, codelet, &mut victims);
    }
    for victim in victims {
        store.delete(&victim)?;
    }
    Ok(())
}

fn collect_owned(store: &Store, group: &str, codelet: &str, out: &mut Vec<String>) {
    for child in store.children(group) {
        let path = format!("{}/{}", group, child);
        let node = match store.get(&path) {
            Some(n) => n,
            None => continue,
        };
        if stamp::owner(node) == Some(codelet) {
            out.push(path);
        } else if node.is_group() && stamp::datatype(node) != Some("data") {
            collect_owned(store, &path, codelet, out);
        }
    }
}

fn walk_items(store: &Store, group: &str, out: &mut Vec<String>) {
    for child in store.children(group) {
        let path = format!("{}/{}", group, child);
        let node = match store.get(&path) {
            Some(n) => n,
            None => continue,
        };
        if node.is_group() && stamp::datatype(node) != Some("data") {
            walk_items(store, &path, out);
        } else {
            out.push(path);
        }
    }
}

fn walk_groups(store: &Store, group: &str, out: &mut Vec<String>) {
    for child in store.children(group) {
        let path = format!("{}/{}", group, child);
        let node = match store.get(&path) {
            Some(n) => n,
            None => continue,
        };
        if node.is_group() && stamp::datatype(node) != Some("data") {
            out.push(path.clone());
            walk_groups(store, &path, out);
        }
    }
}
