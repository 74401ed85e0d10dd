//! Paper references and the local library.
//!
//! A reference token is `scheme:label`. The `local` scheme resolves the
//! label against `ACTIVEPAPERS_LIBRARY` (a colon-separated list of roots,
//! defaulting to `~/.activepapers`); `doi` looks in the first root's cache
//! and otherwise dispatches to a registered fetcher, landing the download
//! with an atomic rename. Opened papers are memoized process-wide so all
//! references to one paper share a single open handle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::paper::{ActivePaper, PaperInner};
use crate::registry;

const LIBRARY_ENV: &str = "ACTIVEPAPERS_LIBRARY";

/// The library roots, in search order.
pub fn library_roots() -> Vec<PathBuf> {
    if let Ok(value) = std::env::var(LIBRARY_ENV) {
        let roots: Vec<PathBuf> = value
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if !roots.is_empty() {
            return roots;
        }
    }
    match dirs::home_dir() {
        Some(home) => vec![home.join(".activepapers")],
        None => Vec::new(),
    }
}

/// Split `scheme:label`, lower-casing the scheme.
pub fn split_paper_ref(paper_ref: &str) -> Result<(String, String)> {
    match paper_ref.split_once(':') {
        Some((scheme, label)) if !label.is_empty() => {
            Ok((scheme.to_ascii_lowercase(), label.to_string()))
        }
        _ => Err(Error::Reference(format!(
            "invalid paper reference {}",
            paper_ref
        ))),
    }
}

/// Downloads one family of DOIs. Registered by the embedding application;
/// the crate itself ships none.
pub trait DoiFetcher: Send + Sync {
    /// Whether this fetcher knows how to handle `label`.
    fn matches(&self, label: &str) -> bool;
    /// Download the paper for `label` into `dest`.
    fn fetch(&self, label: &str, dest: &Path) -> Result<()>;
}

static FETCHERS: Lazy<Mutex<Vec<Box<dyn DoiFetcher>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn register_doi_fetcher(fetcher: Box<dyn DoiFetcher>) {
    FETCHERS.lock().unwrap().push(fetcher);
}

/// Resolve a reference token to a container file on disk, downloading and
/// caching DOI references when a fetcher is available.
pub fn find_in_library(paper_ref: &str) -> Result<PathBuf> {
    let (scheme, label) = split_paper_ref(paper_ref)?;
    let roots = library_roots();
    if roots.is_empty() {
        return Err(Error::Reference(
            "no library roots: set ACTIVEPAPERS_LIBRARY".into(),
        ));
    }
    match scheme.as_str() {
        "local" => {
            let filename = format!("{}.ap", label);
            for root in &roots {
                let candidate = root.join("local").join(&filename);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
            Err(Error::Reference(format!(
                "no such paper in the library: {}",
                paper_ref
            )))
        }
        "doi" => {
            let cached = roots[0].join(format!("{}.ap", label));
            if cached.exists() {
                return Ok(cached);
            }
            if let Some(dir) = cached.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let fetchers = FETCHERS.lock().unwrap();
            let fetcher = fetchers
                .iter()
                .find(|f| f.matches(&label))
                .ok_or_else(|| {
                    Error::Reference(format!("no fetcher available for DOI {}", label))
                })?;
            // Download to a temp file next to the target, then rename, so a
            // partial download never looks like a cached paper.
            let dir = cached.parent().unwrap_or_else(|| Path::new("."));
            let tmp = tempfile::Builder::new()
                .prefix(".ap_download")
                .tempfile_in(dir)?;
            fetcher.fetch(&label, tmp.path())?;
            tmp.persist(&cached).map_err(|e| Error::Io(e.error))?;
            Ok(cached)
        }
        other => Err(Error::Reference(format!("unknown scheme {}", other))),
    }
}

/// Open the paper a reference token points to, shared process-wide.
pub fn open_paper_ref(paper_ref: &str) -> Result<ActivePaper> {
    if let Some(inner) = registry::cached_library_paper(paper_ref) {
        if inner.open.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(ActivePaper::from_inner(inner));
        }
    }
    let path = find_in_library(paper_ref)?;
    let paper = ActivePaper::open(&path, "r")?;
    registry::cache_library_paper(paper_ref, paper.inner_arc());
    Ok(paper)
}

/// Resolve a reference dataset's value into an open paper and a verified
/// path inside it.
pub(crate) fn dereference(paper_ref: &str, path: &str) -> Result<(Arc<PaperInner>, String)> {
    let paper = open_paper_ref(paper_ref)?;
    {
        let store = paper.inner_arc().store.lock().unwrap();
        if !store.contains(path) {
            return Err(Error::Reference(format!(
                "{} has no item {}",
                paper_ref, path
            )));
        }
    }
    Ok((paper.inner_arc().clone(), path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_parsing() {
        assert_eq!(
            split_paper_ref("local:my-paper").unwrap(),
            ("local".to_string(), "my-paper".to_string())
        );
        assert_eq!(
            split_paper_ref("DOI:10.123/x").unwrap(),
            ("doi".to_string(), "10.123/x".to_string())
        );
        assert!(split_paper_ref("nocolon").is_err());
        assert!(split_paper_ref("local:").is_err());
    }
}
