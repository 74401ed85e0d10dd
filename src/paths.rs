//! Path normalization for the three container sections.
//!
//! User-facing paths may be absolute ("/sine" meaning relative to a section
//! root) or relative to the current group. These helpers produce canonical
//! absolute container paths like `/data/sine`.

use crate::error::{Error, Result};

pub const CODE_SECTION: &str = "/code";
pub const DATA_SECTION: &str = "/data";
pub const DOCUMENTATION_SECTION: &str = "/documentation";

pub const SECTIONS: &[&str] = &[CODE_SECTION, DATA_SECTION, DOCUMENTATION_SECTION];

fn validate(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Format("empty path".into()));
    }
    if path.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(Error::Format(format!("illegal path component in {}", path)));
    }
    Ok(())
}

/// Resolve a user path against a section root. An absolute user path is
/// anchored at the section root; a relative one at `base` (itself an
/// absolute container path inside the section).
pub fn resolve_in(base: &str, section: &str, path: &str) -> Result<String> {
    validate(path)?;
    if let Some(rest) = path.strip_prefix('/') {
        if rest.is_empty() {
            return Ok(section.to_string());
        }
        // Already fully qualified?
        if path == section || path.starts_with(&format!("{}/", section)) {
            return Ok(path.to_string());
        }
        return Ok(format!("{}/{}", section, rest));
    }
    Ok(format!("{}/{}", base.trim_end_matches('/'), path))
}

/// Resolve a user path directly against a section root.
pub fn in_section(section: &str, path: &str) -> Result<String> {
    resolve_in(section, section, path)
}

pub fn datapath(path: &str) -> Result<String> {
    in_section(DATA_SECTION, path)
}

pub fn codepath(path: &str) -> Result<String> {
    in_section(CODE_SECTION, path)
}

pub fn docpath(path: &str) -> Result<String> {
    in_section(DOCUMENTATION_SECTION, path)
}

/// The section a fully qualified path belongs to, if any.
pub fn section_of(path: &str) -> Option<&'static str> {
    SECTIONS
        .iter()
        .find(|s| path == **s || path.starts_with(&format!("{}/", s)))
        .copied()
}

pub fn parent(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        if path.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&path[..idx])
    }
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Split a dotted or slashed module name into path segments.
pub fn module_segments(name: &str) -> Vec<&str> {
    name.split(|c| c == '.' || c == '/')
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_paths_anchor_at_the_section() {
        assert_eq!(datapath("/sine").unwrap(), "/data/sine");
        assert_eq!(codepath("/calc").unwrap(), "/code/calc");
    }

    #[test]
    fn already_qualified_paths_pass_through() {
        assert_eq!(datapath("/data/sine").unwrap(), "/data/sine");
    }

    #[test]
    fn relative_paths_join_the_base() {
        assert_eq!(
            resolve_in("/data/results", DATA_SECTION, "sine").unwrap(),
            "/data/results/sine"
        );
        assert_eq!(datapath("a/b").unwrap(), "/data/a/b");
    }

    #[test]
    fn dot_segments_are_rejected() {
        assert!(datapath("../etc").is_err());
        assert!(datapath("a/./b").is_err());
    }

    #[test]
    fn parent_and_basename() {
        assert_eq!(parent("/data/a/b"), Some("/data/a"));
        assert_eq!(parent("/data"), Some("/"));
        assert_eq!(basename("/data/a/b"), "b");
    }

    #[test]
    fn module_names_split_on_dots_and_slashes() {
        assert_eq!(module_segments("pkg.sub"), vec!["pkg", "sub"]);
        assert_eq!(module_segments("pkg/sub"), vec!["pkg", "sub"]);
    }
}
