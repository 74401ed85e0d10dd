//! Module loading for codelet scripts.
//!
//! Imports issued by a codelet resolve in three stages: modules stored in
//! the paper under `/code/python-packages`, the built-in reproducible
//! modules shipped with the crate, and host packages registered by the
//! embedding application. Calclets are held to a whitelist: a host package
//! must be declared by the paper; importlets may import anything that is
//! registered. Every successfully resolved in-paper module is recorded as
//! a dependency of the importing codelet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rhai::{Dynamic, Engine, EvalAltResult, Module, ModuleResolver, Position, Scope, Shared};

use crate::codelet::{CodeletKind, CodeletState};
use crate::error::Error;
use crate::library;
use crate::paper::PaperInner;
use crate::paths;
use crate::stamp;
use crate::value::Value;

/// Group holding importable modules inside a paper.
pub const PACKAGE_GROUP: &str = "/code/python-packages";

/// Reproducible built-in modules every calclet may import.
pub const BUILTIN_MODULES: &[&str] = &["math", "bytes"];

struct HostPackage {
    module: Shared<Module>,
    version: String,
}

static HOST_PACKAGES: Lazy<Mutex<HashMap<String, HostPackage>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a host package (a native rhai module) under `name`.
///
/// Papers declare the host packages they need in
/// `/external-dependencies/python-packages`; opening a paper fails when a
/// declared package has not been registered.
pub fn register_host_package(name: &str, mut module: Module, version: &str) {
    module.build_index();
    HOST_PACKAGES.lock().unwrap().insert(
        name.to_string(),
        HostPackage {
            module: Shared::new(module),
            version: version.to_string(),
        },
    );
}

pub fn have_host_package(name: &str) -> bool {
    HOST_PACKAGES.lock().unwrap().contains_key(name)
}

pub fn host_package(name: &str) -> Option<Shared<Module>> {
    HOST_PACKAGES
        .lock()
        .unwrap()
        .get(name)
        .map(|p| p.module.clone())
}

pub fn host_package_version(name: &str) -> Option<String> {
    HOST_PACKAGES
        .lock()
        .unwrap()
        .get(name)
        .map(|p| p.version.clone())
}

fn make_math_module() -> Shared<Module> {
    let mut m = Module::new();
    m.set_id("math");
    m.set_var("pi", std::f64::consts::PI);
    m.set_var("e", std::f64::consts::E);
    m.set_var("tau", std::f64::consts::TAU);
    m.build_index();
    Shared::new(m)
}

fn pack_i16(values: &rhai::Array, big_endian: bool) -> Result<rhai::Blob, Box<EvalAltResult>> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for v in values {
        let i = v.as_int().map_err(|t| {
            Box::new(EvalAltResult::ErrorRuntime(
                Dynamic::from(format!("expected int, got {}", t)),
                Position::NONE,
            ))
        })?;
        let i = i16::try_from(i).map_err(|_| {
            Box::new(EvalAltResult::ErrorRuntime(
                Dynamic::from(format!("{} does not fit a 16-bit integer", i)),
                Position::NONE,
            ))
        })?;
        let b = if big_endian {
            i.to_be_bytes()
        } else {
            i.to_le_bytes()
        };
        out.extend_from_slice(&b);
    }
    Ok(out)
}

fn unpack_i16(blob: &rhai::Blob, big_endian: bool) -> Result<rhai::Array, Box<EvalAltResult>> {
    if blob.len() % 2 != 0 {
        return Err(Box::new(EvalAltResult::ErrorRuntime(
            Dynamic::from("byte count is not a multiple of 2".to_string()),
            Position::NONE,
        )));
    }
    Ok(blob
        .chunks_exact(2)
        .map(|c| {
            let pair = [c[0], c[1]];
            let i = if big_endian {
                i16::from_be_bytes(pair)
            } else {
                i16::from_le_bytes(pair)
            };
            Dynamic::from(i as i64)
        })
        .collect())
}

fn make_bytes_module() -> Shared<Module> {
    let mut m = Module::new();
    m.set_id("bytes");
    m.set_native_fn("pack_i16_le", |values: rhai::Array| pack_i16(&values, false));
    m.set_native_fn("pack_i16_be", |values: rhai::Array| pack_i16(&values, true));
    m.set_native_fn("unpack_i16_le", |blob: rhai::Blob| unpack_i16(&blob, false));
    m.set_native_fn("unpack_i16_be", |blob: rhai::Blob| unpack_i16(&blob, true));
    m.build_index();
    Shared::new(m)
}

pub(crate) fn builtin_module(name: &str) -> Option<Shared<Module>> {
    static MATH: Lazy<Shared<Module>> = Lazy::new(make_math_module);
    static BYTES: Lazy<Shared<Module>> = Lazy::new(make_bytes_module);
    match name {
        "math" => Some(MATH.clone()),
        "bytes" => Some(BYTES.clone()),
        _ => None,
    }
}

fn script_err(e: Error, pos: Position) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(e.to_string()),
        pos,
    ))
}

/// Per-execution module resolver carrying the running codelet's context.
pub(crate) struct CodeletResolver {
    pub paper: Arc<PaperInner>,
    pub codelet: Arc<CodeletState>,
}

impl CodeletResolver {
    /// Find the `/code/python-packages` node for a module name, following
    /// references across papers. Returns the owning paper, the node path
    /// and the source text; `None` when nothing suitable exists.
    fn find_local(
        &self,
        name: &str,
    ) -> Result<Option<(Arc<PaperInner>, String, String)>, Error> {
        let segments = paths::module_segments(name);
        if segments.is_empty() {
            return Ok(None);
        }
        let mut paper = self.paper.clone();
        let mut node_path = format!("{}/{}", PACKAGE_GROUP, segments.join("/"));
        loop {
            enum Found {
                Reference(String, String),
                Package,
                Module(String),
                NotAModule,
            }
            let found = {
                let store = paper.store.lock().unwrap();
                match store.get(&node_path) {
                    None => return Ok(None),
                    Some(node) if node.is_group() => Found::Package,
                    Some(node) => match node.value() {
                        Some(Value::Reference { paper_ref, path }) => {
                            Found::Reference(paper_ref.clone(), path.clone())
                        }
                        Some(Value::Str(text))
                            if stamp::datatype(node) == Some("module")
                                && stamp::language(node)
                                    == Some(self.codelet.language.as_str()) =>
                        {
                            Found::Module(text.clone())
                        }
                        _ => Found::NotAModule,
                    },
                }
            };
            match found {
                Found::Reference(paper_ref, target) => {
                    let (foreign, target) = library::dereference(&paper_ref, &target)?;
                    paper = foreign;
                    node_path = target;
                }
                Found::Package => {
                    node_path = format!("{}/__init__", node_path);
                    // Loop once more to load the __init__ module itself.
                }
                Found::Module(text) => return Ok(Some((paper, node_path, text))),
                Found::NotAModule => return Ok(None),
            }
        }
    }

    fn load_local(
        &self,
        engine: &Engine,
        name: &str,
        pos: Position,
    ) -> Result<Option<Shared<Module>>, Box<EvalAltResult>> {
        let (owning_paper, node_path, text) = match self
            .find_local(name)
            .map_err(|e| script_err(e, pos))?
        {
            Some(found) => found,
            None => return Ok(None),
        };

        if let Some(cached) = self.paper.local_modules.lock().unwrap().get(name) {
            if Arc::ptr_eq(&owning_paper, &self.paper) {
                self.codelet.add_dependency(&node_path);
            }
            return Ok(Some(cached.clone()));
        }

        let mut ast = engine.compile(&text).map_err(|e| {
            Box::new(EvalAltResult::ErrorInModule(
                name.to_string(),
                script_err(Error::Format(e.to_string()), pos),
                pos,
            ))
        })?;
        ast.set_source(format!("{}:{}", owning_paper.id, node_path));
        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine).map_err(|e| {
            Box::new(EvalAltResult::ErrorInModule(name.to_string(), e, pos))
        })?;
        let shared = Shared::new(module);
        self.paper
            .local_modules
            .lock()
            .unwrap()
            .insert(name.to_string(), shared.clone());
        if Arc::ptr_eq(&owning_paper, &self.paper) {
            self.codelet.add_dependency(&node_path);
        }
        Ok(Some(shared))
    }
}

impl ModuleResolver for CodeletResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        if let Some(module) = self.load_local(engine, path, pos)? {
            return Ok(module);
        }
        if let Some(module) = builtin_module(path) {
            return Ok(module);
        }
        match self.codelet.kind {
            CodeletKind::Calclet => {
                let declared = self.paper.packages.iter().any(|p| p == path);
                if declared {
                    if let Some(module) = host_package(path) {
                        return Ok(module);
                    }
                }
                Err(script_err(Error::ForbiddenImport(path.to_string()), pos))
            }
            CodeletKind::Importlet => host_package(path).ok_or_else(|| {
                Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos))
            }),
        }
    }
}
