//! Process-wide registries with weak entries.
//!
//! Three maps: open papers by process-unique id, running codelets by
//! `(paper id, codelet path)`, and library papers by reference token.
//! Entries are weak so a paper dropped without an explicit close does not
//! leak; dead entries are swept on insert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;

use crate::codelet::CodeletState;
use crate::paper::PaperInner;

static PAPERS: Lazy<Mutex<HashMap<String, Weak<PaperInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static CODELETS: Lazy<Mutex<HashMap<(String, String), Weak<CodeletState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static LIBRARY_PAPERS: Lazy<Mutex<HashMap<String, Weak<PaperInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn sweep<K: Clone + std::hash::Hash + Eq, V>(map: &mut HashMap<K, Weak<V>>) {
    map.retain(|_, w| w.strong_count() > 0);
}

pub(crate) fn register_paper(id: &str, paper: &Arc<PaperInner>) {
    let mut map = PAPERS.lock().unwrap();
    sweep(&mut map);
    map.insert(id.to_string(), Arc::downgrade(paper));
}

pub(crate) fn unregister_paper(id: &str) {
    PAPERS.lock().unwrap().remove(id);
}

pub(crate) fn lookup_paper(id: &str) -> Option<Arc<PaperInner>> {
    PAPERS.lock().unwrap().get(id).and_then(Weak::upgrade)
}

pub(crate) fn register_codelet(paper_id: &str, path: &str, state: &Arc<CodeletState>) {
    let mut map = CODELETS.lock().unwrap();
    sweep(&mut map);
    map.insert(
        (paper_id.to_string(), path.to_string()),
        Arc::downgrade(state),
    );
}

pub(crate) fn unregister_codelet(paper_id: &str, path: &str) {
    CODELETS
        .lock()
        .unwrap()
        .remove(&(paper_id.to_string(), path.to_string()));
}

pub(crate) fn lookup_codelet(paper_id: &str, path: &str) -> Option<Arc<CodeletState>> {
    CODELETS
        .lock()
        .unwrap()
        .get(&(paper_id.to_string(), path.to_string()))
        .and_then(Weak::upgrade)
}

/// Memoized library papers: one shared open paper per reference token.
pub(crate) fn cached_library_paper(paper_ref: &str) -> Option<Arc<PaperInner>> {
    LIBRARY_PAPERS
        .lock()
        .unwrap()
        .get(paper_ref)
        .and_then(Weak::upgrade)
}

pub(crate) fn cache_library_paper(paper_ref: &str, paper: &Arc<PaperInner>) {
    let mut map = LIBRARY_PAPERS.lock().unwrap();
    sweep(&mut map);
    map.insert(paper_ref.to_string(), Arc::downgrade(paper));
}
