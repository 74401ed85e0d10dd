//! Read-only view over the `/code` section.
//!
//! Lookup follows reference items transparently and yields lightweight
//! descriptors carrying path, tag, language and source text. Inspection
//! only: nothing here records dependencies.

use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult};

use crate::error::{Error, Result};
use crate::library;
use crate::paper::PaperInner;
use crate::paths;
use crate::stamp;
use crate::value::Value;

/// Read-only wrapper around a group under `/code`.
#[derive(Clone)]
pub struct CodeView {
    pub(crate) paper: Arc<PaperInner>,
    pub(crate) path: String,
}

/// Descriptor of a single code item.
#[derive(Clone, Debug)]
pub struct CodeFile {
    pub path: String,
    pub datatype: String,
    pub language: Option<String>,
    pub text: String,
}

pub enum CodeItem {
    Group(CodeView),
    File(CodeFile),
}

impl CodeView {
    pub(crate) fn root(paper: Arc<PaperInner>) -> CodeView {
        CodeView {
            paper,
            path: paths::CODE_SECTION.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.path
    }

    pub fn keys(&self) -> Vec<String> {
        let store = self.paper.store.lock().unwrap();
        store.children(&self.path)
    }

    /// Look up a code item, dereferencing reference nodes on the way.
    pub fn get(&self, user_path: &str) -> Result<CodeItem> {
        let full = paths::resolve_in(&self.path, paths::CODE_SECTION, user_path)?;
        let mut paper = self.paper.clone();
        let mut current = full;
        loop {
            let (is_group, is_reference, reference) = {
                let store = paper.store.lock().unwrap();
                let node = store.require(&current)?;
                let reference = match node.value() {
                    Some(Value::Reference { paper_ref, path }) => {
                        Some((paper_ref.clone(), path.clone()))
                    }
                    _ => None,
                };
                (
                    node.is_group(),
                    stamp::datatype(node) == Some("reference"),
                    reference,
                )
            };
            if is_reference {
                let (paper_ref, target) = reference.ok_or_else(|| {
                    Error::Format(format!("{}: malformed reference dataset", current))
                })?;
                let (foreign, target) = library::dereference(&paper_ref, &target)?;
                paper = foreign;
                current = target;
                continue;
            }
            if is_group {
                return Ok(CodeItem::Group(CodeView {
                    paper,
                    path: current,
                }));
            }
            let store = paper.store.lock().unwrap();
            let node = store.require(&current)?;
            let text = match node.value() {
                Some(Value::Str(s)) => s.clone(),
                _ => {
                    return Err(Error::Format(format!(
                        "{} does not hold source text",
                        current
                    )))
                }
            };
            return Ok(CodeItem::File(CodeFile {
                path: current.clone(),
                datatype: stamp::datatype(node).unwrap_or("").to_string(),
                language: stamp::language(node).map(|s| s.to_string()),
                text,
            }));
        }
    }

    // ------------------------------------------------------------------
    // rhai-facing wrappers
    // ------------------------------------------------------------------

    pub(crate) fn rhai_index_get(
        &mut self,
        name: &str,
    ) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        match self.get(name).map_err(Error::into_script)? {
            CodeItem::Group(g) => Ok(Dynamic::from(g)),
            CodeItem::File(f) => Ok(Dynamic::from(f)),
        }
    }

    pub(crate) fn rhai_keys(&mut self) -> rhai::Array {
        self.keys().into_iter().map(Dynamic::from).collect()
    }

    pub(crate) fn rhai_name(&mut self) -> String {
        self.path.clone()
    }
}

impl CodeFile {
    pub(crate) fn rhai_path(&mut self) -> String {
        self.path.clone()
    }

    pub(crate) fn rhai_kind(&mut self) -> String {
        self.datatype.clone()
    }

    pub(crate) fn rhai_language(&mut self) -> String {
        self.language.clone().unwrap_or_default()
    }

    pub(crate) fn rhai_text(&mut self) -> String {
        self.text.clone()
    }
}
