//! Codelet execution: the restricted environment scripts run in, the
//! dependency accumulation, and container-aware tracebacks.
//!
//! Two flavours share one skeleton: calclets are reproducible and see the
//! import whitelist; importlets are unrestricted and record no
//! dependencies. Each execution builds a fresh engine whose views, file
//! factory and module resolver all carry the codelet's context, so every
//! observed read lands in `CodeletState::deps` and every stamp lands in
//! `CodeletState::outputs`. After a successful run the outputs are
//! re-stamped once more with the final aggregated dependency list.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};

use crate::code::{CodeFile, CodeView};
use crate::error::{Error, Result};
use crate::internal_file::{Encoding, InternalFile, OpenMode};
use crate::modules::CodeletResolver;
use crate::paper::{self, PaperInner};
use crate::paths;
use crate::registry;
use crate::stamp::{self, StampAttrs};
use crate::store::Node;
use crate::value::Value;
use crate::views::{AttrsView, DataView, DatasetView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeletKind {
    Calclet,
    Importlet,
}

impl CodeletKind {
    pub fn from_tag(tag: &str) -> Option<CodeletKind> {
        match tag {
            "calclet" => Some(CodeletKind::Calclet),
            "importlet" => Some(CodeletKind::Importlet),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            CodeletKind::Calclet => "calclet",
            CodeletKind::Importlet => "importlet",
        }
    }
}

/// Mutable state of one codelet execution.
pub struct CodeletState {
    pub paper_id: String,
    pub path: String,
    pub kind: CodeletKind,
    pub language: String,
    /// Accumulated dependencies; `None` for importlets, whose results are
    /// not reproducible by contract.
    deps: Option<Mutex<BTreeSet<String>>>,
    /// Every path this execution stamped; re-stamped once more on success.
    outputs: Mutex<BTreeSet<String>>,
}

impl CodeletState {
    fn new(paper_id: &str, path: &str, kind: CodeletKind, language: &str) -> CodeletState {
        CodeletState {
            paper_id: paper_id.to_string(),
            path: path.to_string(),
            kind,
            language: language.to_string(),
            deps: match kind {
                CodeletKind::Calclet => Some(Mutex::new(BTreeSet::new())),
                CodeletKind::Importlet => None,
            },
            outputs: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn add_dependency(&self, path: &str) {
        if let Some(deps) = &self.deps {
            deps.lock().unwrap().insert(path.to_string());
        }
    }

    pub fn note_output(&self, path: &str) {
        self.outputs.lock().unwrap().insert(path.to_string());
    }

    pub fn owns(&self, node: &Node) -> bool {
        stamp::owner(node) == Some(self.path.as_str())
    }

    /// The provenance payload for a stamp performed right now.
    pub fn stamp_attrs(&self) -> StampAttrs {
        let dependencies = self.deps.as_ref().map(|deps| {
            let mut list: Vec<String> = deps.lock().unwrap().iter().cloned().collect();
            list.push(self.path.clone());
            list.sort();
            list
        });
        StampAttrs {
            generating_codelet: Some(self.path.clone()),
            dependencies,
        }
    }

    fn outputs(&self) -> Vec<String> {
        self.outputs.lock().unwrap().iter().cloned().collect()
    }
}

/// Who is writing: a running codelet, or code outside any codelet. The
/// external pseudo-owner may write anything and stamps without provenance.
#[derive(Clone)]
pub enum Creator {
    External,
    Codelet(Arc<CodeletState>),
}

impl Creator {
    pub fn stamp_attrs(&self) -> StampAttrs {
        match self {
            Creator::External => StampAttrs::default(),
            Creator::Codelet(c) => c.stamp_attrs(),
        }
    }

    pub fn owns(&self, node: &Node) -> bool {
        match self {
            Creator::External => true,
            Creator::Codelet(c) => c.owns(node),
        }
    }

    pub fn note_output(&self, path: &str) {
        if let Creator::Codelet(c) = self {
            c.note_output(path);
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Creator::External => None,
            Creator::Codelet(c) => Some(&c.path),
        }
    }
}

/// Handle to a stored codelet, as returned by `create_calclet` and
/// `create_importlet`.
pub struct Codelet {
    pub(crate) paper: Arc<PaperInner>,
    pub path: String,
}

impl Codelet {
    /// Run the codelet; a captured script failure comes back as the
    /// rewritten traceback text.
    pub fn run(&self) -> Result<Option<String>> {
        run(&self.paper, &self.path, false)
    }
}

/// rhai-facing handle over an internal file.
#[derive(Clone)]
pub struct FileHandle(pub(crate) Arc<Mutex<InternalFile>>);

impl FileHandle {
    fn with<T>(
        &mut self,
        f: impl FnOnce(&mut InternalFile) -> Result<T>,
    ) -> std::result::Result<T, Box<EvalAltResult>> {
        let mut file = self.0.lock().unwrap();
        f(&mut file).map_err(Error::into_script)
    }

    pub(crate) fn rhai_read(&mut self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.with(|f| f.read(None).map(|c| c.into_dynamic()))
    }

    pub(crate) fn rhai_read_n(
        &mut self,
        n: i64,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.with(|f| f.read(Some(n.max(0) as usize)).map(|c| c.into_dynamic()))
    }

    pub(crate) fn rhai_readline(&mut self) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        self.with(|f| f.readline().map(|c| c.into_dynamic()))
    }

    pub(crate) fn rhai_readlines(
        &mut self,
    ) -> std::result::Result<rhai::Array, Box<EvalAltResult>> {
        self.with(|f| {
            Ok(f.readlines()?
                .into_iter()
                .map(|c| c.into_dynamic())
                .collect())
        })
    }

    pub(crate) fn rhai_write_str(
        &mut self,
        text: &str,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.with(|f| f.write_str(text))
    }

    pub(crate) fn rhai_write_blob(
        &mut self,
        data: rhai::Blob,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.with(|f| f.write_bytes(&data))
    }

    pub(crate) fn rhai_seek(
        &mut self,
        offset: i64,
    ) -> std::result::Result<(), Box<EvalAltResult>> {
        self.with(|f| f.seek(offset))
    }

    pub(crate) fn rhai_tell(&mut self) -> std::result::Result<i64, Box<EvalAltResult>> {
        self.with(|f| f.tell().map(|p| p as i64))
    }

    pub(crate) fn rhai_truncate(&mut self) -> std::result::Result<(), Box<EvalAltResult>> {
        self.with(|f| f.truncate(None))
    }

    pub(crate) fn rhai_close(&mut self) -> std::result::Result<(), Box<EvalAltResult>> {
        self.with(|f| f.close())
    }

    pub(crate) fn rhai_name(&mut self) -> String {
        self.0.lock().unwrap().name().to_string()
    }
}

fn register_view_types(engine: &mut Engine) {
    engine
        .register_type_with_name::<DataView>("DataGroup")
        .register_indexer_get(DataView::rhai_index_get)
        .register_indexer_set(DataView::rhai_index_set)
        .register_fn("create_dataset", DataView::rhai_create_dataset)
        .register_fn("require_dataset", DataView::rhai_require_dataset)
        .register_fn("create_group", DataView::rhai_create_group)
        .register_fn("require_group", DataView::rhai_require_group)
        .register_fn("mark_as_data_item", DataView::rhai_mark_as_data_item)
        .register_fn("remove", DataView::rhai_remove)
        .register_fn("keys", DataView::rhai_keys)
        .register_fn("contains", DataView::rhai_contains)
        .register_fn("len", DataView::rhai_len)
        .register_get("name", DataView::rhai_name)
        .register_get("attrs", DataView::rhai_attrs)
        .register_set("attrs", DataView::rhai_set_attrs);

    engine
        .register_type_with_name::<DatasetView>("Dataset")
        .register_get("value", DatasetView::rhai_value)
        .register_indexer_get(DatasetView::rhai_index_get)
        .register_indexer_set(DatasetView::rhai_index_set)
        .register_fn("len", DatasetView::rhai_len)
        .register_fn("resize", DatasetView::rhai_resize)
        .register_fn("write_direct", DatasetView::rhai_write_direct)
        .register_get("name", DatasetView::rhai_name)
        .register_get("attrs", DatasetView::rhai_attrs)
        .register_set("attrs", DatasetView::rhai_set_attrs);

    engine
        .register_type_with_name::<AttrsView>("Attributes")
        .register_indexer_get(AttrsView::rhai_index_get)
        .register_indexer_set(AttrsView::rhai_index_set)
        .register_fn("contains", AttrsView::rhai_contains)
        .register_fn("keys", AttrsView::rhai_keys)
        .register_fn("remove", AttrsView::rhai_remove)
        .register_fn("len", AttrsView::rhai_len);

    engine
        .register_type_with_name::<CodeView>("CodeGroup")
        .register_indexer_get(CodeView::rhai_index_get)
        .register_fn("keys", CodeView::rhai_keys)
        .register_get("name", CodeView::rhai_name);

    engine
        .register_type_with_name::<CodeFile>("CodeFile")
        .register_get("path", CodeFile::rhai_path)
        .register_get("kind", CodeFile::rhai_kind)
        .register_get("language", CodeFile::rhai_language)
        .register_get("text", CodeFile::rhai_text);

    engine
        .register_type_with_name::<FileHandle>("File")
        .register_fn("read", FileHandle::rhai_read)
        .register_fn("read", FileHandle::rhai_read_n)
        .register_fn("readline", FileHandle::rhai_readline)
        .register_fn("readlines", FileHandle::rhai_readlines)
        .register_fn("write", FileHandle::rhai_write_str)
        .register_fn("write", FileHandle::rhai_write_blob)
        .register_fn("seek", FileHandle::rhai_seek)
        .register_fn("tell", FileHandle::rhai_tell)
        .register_fn("truncate", FileHandle::rhai_truncate)
        .register_fn("close", FileHandle::rhai_close)
        .register_get("name", FileHandle::rhai_name);
}

fn open_from_script(
    paper: &Arc<PaperInner>,
    state: &Arc<CodeletState>,
    section: &'static str,
    path: &str,
    mode: &str,
    encoding: Option<&str>,
) -> std::result::Result<FileHandle, Box<EvalAltResult>> {
    // Catch obvious attempts to reach host files instead of internal ones.
    if path.starts_with('~') {
        return Err(Error::PermissionDenied(path.to_string()).into_script());
    }
    let abs = paths::in_section(section, path).map_err(Error::into_script)?;
    let encoding = match encoding {
        Some(name) => Some(Encoding::parse(name).map_err(Error::into_script)?),
        None => None,
    };
    let (open_mode, _) = OpenMode::parse(mode).map_err(Error::into_script)?;
    let file = paper::open_internal_file_impl(
        paper,
        &abs,
        mode,
        encoding,
        Creator::Codelet(state.clone()),
    )
    .map_err(Error::into_script)?;
    if open_mode == OpenMode::Read {
        state.add_dependency(&abs);
    }
    Ok(FileHandle(Arc::new(Mutex::new(file))))
}

fn register_facade(engine: &mut Engine, paper: &Arc<PaperInner>, state: &Arc<CodeletState>) {
    for (name, section) in [
        ("open", paths::DATA_SECTION),
        ("open_documentation", paths::DOCUMENTATION_SECTION),
    ] {
        let p = paper.clone();
        let s = state.clone();
        engine.register_fn(name, move |path: &str| {
            open_from_script(&p, &s, section, path, "r", None)
        });
        let p = paper.clone();
        let s = state.clone();
        engine.register_fn(name, move |path: &str, mode: &str| {
            open_from_script(&p, &s, section, path, mode, None)
        });
        let p = paper.clone();
        let s = state.clone();
        engine.register_fn(name, move |path: &str, mode: &str, encoding: &str| {
            open_from_script(&p, &s, section, path, mode, Some(encoding))
        });
    }

    let p = paper.clone();
    engine.register_fn(
        "snapshot",
        move |target: &str| -> std::result::Result<(), Box<EvalAltResult>> {
            paper::snapshot_impl(&p, std::path::Path::new(target)).map_err(Error::into_script)
        },
    );
}

fn build_engine(paper: &Arc<PaperInner>, state: &Arc<CodeletState>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(CodeletResolver {
        paper: paper.clone(),
        codelet: state.clone(),
    });
    register_view_types(&mut engine);
    register_facade(&mut engine, paper, state);
    engine.on_print(|text| tracing::info!(target: "activepapers::codelet", "{}", text));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(
            target: "activepapers::codelet",
            "{} @ {:?}: {}",
            source.unwrap_or("?"),
            pos,
            text
        )
    });
    engine
}

struct RegistryGuard {
    paper_id: String,
    path: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        registry::unregister_codelet(&self.paper_id, &self.path);
    }
}

/// Execute the codelet stored at `path` inside `paper`.
///
/// Returns `Ok(None)` on success and `Ok(Some(traceback))` when the script
/// failed; with `debug` the failure is raised as an error instead.
pub(crate) fn run(
    paper: &Arc<PaperInner>,
    path: &str,
    debug: bool,
) -> Result<Option<String>> {
    let path = paths::codepath(path)?;
    let (kind, language, script) = {
        let store = paper.store.lock().unwrap();
        let node = store.require(&path)?;
        let tag = stamp::datatype(node)
            .ok_or_else(|| Error::Format(format!("{} is not a codelet", path)))?;
        let kind = CodeletKind::from_tag(tag)
            .ok_or_else(|| Error::Format(format!("{} has type {}, not a codelet", path, tag)))?;
        let language = stamp::language(node).unwrap_or("rhai").to_string();
        let script = match node.value() {
            Some(Value::Str(text)) => text.clone(),
            _ => return Err(Error::Format(format!("{} holds no script text", path))),
        };
        (kind, language, script)
    };

    tracing::info!(
        target: "activepapers::codelet",
        "running {} {}",
        kind.tag(),
        path
    );

    if registry::lookup_codelet(&paper.id, &path).is_some() {
        return Err(Error::Invariant(format!("{} is already running", path)));
    }

    // Re-running invalidates everything this codelet produced before.
    paper::remove_owned_by(paper, &path)?;

    let state = Arc::new(CodeletState::new(&paper.id, &path, kind, &language));
    let engine = build_engine(paper, &state);

    let source_name = format!("{}:{}", paper.id, path);
    let mut ast = match engine.compile(&script) {
        Ok(ast) => ast,
        Err(e) => {
            let text = format!(
                "Compilation of {}:{} failed: {}",
                paper.filename.display(),
                path,
                e
            );
            if debug {
                return Err(Error::CodeletFailed(text));
            }
            return Ok(Some(text));
        }
    };
    ast.set_source(source_name);

    let mut scope = Scope::new();
    scope.push("data", DataView::root(paper.clone(), paths::DATA_SECTION, Some(state.clone())));
    scope.push("code", CodeView::root(paper.clone()));

    registry::register_codelet(&paper.id, &path, &state);
    let _guard = RegistryGuard {
        paper_id: paper.id.clone(),
        path: path.clone(),
    };

    match engine.run_ast_with_scope(&mut scope, &ast) {
        Ok(()) => {
            finalize_outputs(paper, &state)?;
            Ok(None)
        }
        Err(e) => {
            let text = format_traceback(paper, &path, &e);
            if debug {
                Err(Error::CodeletFailed(text))
            } else {
                Ok(Some(text))
            }
        }
    }
}

/// Re-stamp every output with the final aggregated dependency list.
fn finalize_outputs(paper: &Arc<PaperInner>, state: &Arc<CodeletState>) -> Result<()> {
    let attrs = state.stamp_attrs();
    let mut store = paper.store.lock().unwrap();
    for output in state.outputs() {
        if let Some(node) = store.get_mut(&output) {
            let tag = stamp::datatype(node).unwrap_or("data").to_string();
            stamp::stamp(node, &tag, &attrs)?;
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Traceback rewriting
// ----------------------------------------------------------------------

fn resolve_source(default_source: &str, source: Option<&str>) -> String {
    let source = source.unwrap_or(default_source);
    if let Some((paper_id, code_path)) = source.split_once(':') {
        if let Some(paper) = registry::lookup_paper(paper_id) {
            return format!("{}:{}", paper.filename.display(), code_path);
        }
        return format!("<paper>:{}", code_path);
    }
    source.to_string()
}

fn source_line(source: Option<&str>, default_source: &str, line: usize) -> Option<String> {
    let source = source.unwrap_or(default_source);
    let (paper_id, code_path) = source.split_once(':')?;
    let paper = registry::lookup_paper(paper_id)?;
    let store = paper.store.lock().unwrap();
    let node = store.get(code_path)?;
    match node.value() {
        Some(Value::Str(text)) => text.lines().nth(line.saturating_sub(1)).map(str::to_string),
        _ => None,
    }
}

/// Turn a rhai error chain into a traceback whose `paper-id:path` source
/// names are rewritten to `container-filename:path`, with source lines
/// pulled back out of the container.
fn format_traceback(paper: &Arc<PaperInner>, codelet_path: &str, err: &EvalAltResult) -> String {
    let default_source = format!("{}:{}", paper.id, codelet_path);
    let mut frames: Vec<(Option<String>, Position, Option<String>)> = Vec::new();
    let mut current: &EvalAltResult = err;
    loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                frames.push((
                    (!source.is_empty()).then(|| source.clone()),
                    *pos,
                    Some(name.clone()),
                ));
                current = inner.as_ref();
            }
            EvalAltResult::ErrorInModule(name, inner, pos) => {
                frames.push((None, *pos, Some(format!("import \"{}\"", name))));
                current = inner.as_ref();
            }
            other => {
                frames.push((None, other.position(), None));
                break;
            }
        }
    }

    let mut text = String::from("Codelet traceback (most recent call last):\n");
    for (source, pos, context) in &frames {
        let shown = resolve_source(&default_source, source.as_deref());
        match pos.line() {
            Some(line) => {
                text.push_str(&format!("  File \"{}\", line {}", shown, line));
                if let Some(context) = context {
                    text.push_str(&format!(", in {}", context));
                }
                text.push('\n');
                if let Some(code) = source_line(source.as_deref(), &default_source, line) {
                    text.push_str(&format!("    {}\n", code.trim_end()));
                }
            }
            None => {
                text.push_str(&format!("  File \"{}\"", shown));
                if let Some(context) = context {
                    text.push_str(&format!(", in {}", context));
                }
                text.push('\n');
            }
        }
    }
    let message = current.to_string();
    text.push_str(&message);
    if !message.ends_with('\n') {
        text.push('\n');
    }
    text
}
