//! File exchange between a paper and the working directory: extraction
//! heuristics, checkin/checkout plumbing and pattern matching.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};
use crate::paper::ActivePaper;
use crate::stamp;
use crate::value::{AttrValue, Value};

/// Item types that can be exchanged with plain files.
pub const EXTRACTABLE_TYPES: &[&str] = &["calclet", "importlet", "module", "file", "text"];

/// `(tag, language) -> file extension` used by checkout and extract.
const EXTENSIONS: &[(&str, Option<&str>, &str)] = &[
    ("calclet", Some("python"), ".py"),
    ("importlet", Some("python"), ".py"),
    ("module", Some("python"), ".py"),
    ("calclet", Some("rhai"), ".rhai"),
    ("importlet", Some("rhai"), ".rhai"),
    ("module", Some("rhai"), ".rhai"),
    ("file", None, ""),
    ("text", Some("HTML"), ".html"),
    ("text", Some("LaTeX"), ".tex"),
    ("text", Some("markdown"), ".md"),
    ("text", Some("reStructuredText"), ".rst"),
    ("text", None, ".txt"),
];

pub fn extension_for(tag: &str, language: Option<&str>) -> &'static str {
    EXTENSIONS
        .iter()
        .find(|(t, l, _)| *t == tag && *l == language)
        .or_else(|| EXTENSIONS.iter().find(|(t, l, _)| *t == tag && l.is_none()))
        .map(|(_, _, ext)| *ext)
        .unwrap_or("")
}

pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        ".py" => Some("python"),
        ".rhai" => Some("rhai"),
        ".html" => Some("HTML"),
        ".tex" => Some("LaTeX"),
        ".md" => Some("markdown"),
        ".rst" => Some("reStructuredText"),
        _ => None,
    }
}

/// Build a matcher from shell-style patterns; each pattern `p` also
/// matches everything below `p/`.
pub fn build_patterns(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).map_err(|e| Error::Format(format!("bad pattern: {}", e)))?,
        );
        if !pattern.ends_with('?') && !pattern.ends_with('*') && !pattern.ends_with('/') {
            let dir_pattern = format!("{}/*", pattern);
            builder.add(
                Glob::new(&dir_pattern)
                    .map_err(|e| Error::Format(format!("bad pattern: {}", e)))?,
            );
        }
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::Format(format!("bad pattern set: {}", e)))
}

pub fn matches(set: &Option<GlobSet>, name: &str) -> bool {
    match set {
        None => true,
        Some(set) => set.is_match(name),
    }
}

/// Bytes an item contributes to a checkout.
pub fn item_bytes(paper: &ActivePaper, item: &str) -> Result<Vec<u8>> {
    let tag = paper
        .datatype_of(item)
        .ok_or_else(|| Error::Format(format!("{} has no datatype", item)))?;
    if !EXTRACTABLE_TYPES.contains(&tag.as_str()) {
        return Err(Error::Format(format!(
            "cannot extract {} of type {}",
            item, tag
        )));
    }
    match paper.get_value(item)? {
        Value::Bytes(b) => Ok(b),
        Value::Str(s) => Ok(s.into_bytes()),
        other => Err(Error::Format(format!(
            "cannot extract {} holding {}",
            item,
            other.kind_name()
        ))),
    }
}

pub enum ExtractTarget<'a> {
    Stdout,
    File(&'a Path),
    /// Place the item under this directory using its container path.
    Directory(&'a Path),
}

/// Extract one item; returns the file written, if any.
pub fn extract_to_file(
    paper: &ActivePaper,
    item: &str,
    target: ExtractTarget<'_>,
) -> Result<Option<PathBuf>> {
    let bytes = item_bytes(paper, item)?;
    let filename = match target {
        ExtractTarget::Stdout => {
            std::io::stdout().write_all(&bytes)?;
            return Ok(None);
        }
        ExtractTarget::File(path) => path.to_path_buf(),
        ExtractTarget::Directory(dir) => {
            let relative: PathBuf = item.trim_start_matches('/').split('/').collect();
            let mut filename = dir.join(relative);
            let has_extension = filename
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains('.'))
                .unwrap_or(false);
            if !has_extension {
                let tag = paper.datatype_of(item).unwrap_or_default();
                let language = paper.language_of(item);
                let ext = extension_for(&tag, language.as_deref());
                if !ext.is_empty() {
                    let name = format!(
                        "{}{}",
                        filename.file_name().unwrap().to_string_lossy(),
                        ext
                    );
                    filename.set_file_name(name);
                }
            }
            filename
        }
    };
    if let Some(dir) = filename.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(&filename, &bytes)?;
    Ok(Some(filename))
}

fn file_mtime_ms(path: &Path) -> Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    let since = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(since.as_millis() as i64)
}

fn split_extension(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && !name[idx..].contains('/') => {
            (name[..idx].to_string(), name[idx..].to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}

/// Create or update one item from a file in the working directory.
///
/// `filename` is relative to the working directory with forward slashes;
/// it doubles as the item path. Returns a human-readable action message
/// for dry runs.
pub fn update_from_file(
    paper: &ActivePaper,
    filename: &Path,
    datatype: Option<&str>,
    force: bool,
    dry_run: bool,
) -> Result<Option<String>> {
    if !filename.exists() {
        return Err(Error::MissingItem(format!("{}", filename.display())));
    }
    let mtime = file_mtime_ms(filename)?;
    let rel = filename.to_string_lossy().replace('\\', "/");
    let full = format!("/{}", rel.trim_start_matches('/'));

    let (mut basename, mut ext);
    let existing = if paper.contains(&full) {
        basename = full.clone();
        ext = String::new();
        Some(full.clone())
    } else {
        let (stem, extension) = split_extension(&full);
        basename = stem;
        ext = extension;
        paper.contains(&basename).then(|| basename.clone())
    };
    let mut language = language_for_extension(&ext).map(str::to_string);
    let mut datatype = datatype.map(str::to_string);

    match &existing {
        None => {
            let tag = datatype.clone().ok_or_else(|| {
                Error::Format(format!("datatype required to create new item {}", basename))
            })?;
            match tag.as_str() {
                "calclet" | "importlet" | "module" => {
                    if !basename.starts_with("/code/") {
                        return Err(Error::Format(format!(
                            "items of type {} must be in the code section",
                            tag
                        )));
                    }
                    if language.as_deref() != Some("rhai") {
                        return Err(Error::Format(format!(
                            "items of type {} must be rhai code",
                            tag
                        )));
                    }
                    if tag == "module" && !basename.starts_with("/code/python-packages/") {
                        return Err(Error::Format(
                            "modules must be in code/python-packages".into(),
                        ));
                    }
                }
                "file" => {
                    if !basename.starts_with("/data/")
                        && !basename.starts_with("/documentation/")
                    {
                        return Err(Error::Format(
                            "items of type file must be in the data or documentation section"
                                .into(),
                        ));
                    }
                    // Files keep their extension as part of the item name.
                    basename.push_str(&ext);
                    ext.clear();
                }
                "text" => {
                    if !basename.starts_with("/documentation/") {
                        return Err(Error::Format(
                            "items of type text must be in the documentation section".into(),
                        ));
                    }
                }
                other => {
                    return Err(Error::Format(format!(
                        "cannot create items of type {}",
                        other
                    )))
                }
            }
        }
        Some(item) => {
            let item_time = paper.timestamp_of(item).unwrap_or(0);
            if mtime <= item_time && !force {
                return Ok(dry_run
                    .then(|| format!("Skip {}: file {} is not newer", item, filename.display())));
            }
            let current = paper.datatype_of(item);
            if let Some(requested) = &datatype {
                if current.as_deref() != Some(requested.as_str())
                    && !(current.as_deref() == Some("file") && requested == "text")
                {
                    return Err(Error::Format(format!(
                        "cannot change datatype {} to {}",
                        current.as_deref().unwrap_or("?"),
                        requested
                    )));
                }
            } else {
                datatype = current;
            }
            if language.is_none() {
                language = paper.language_of(item);
            }
        }
    }

    let tag = datatype.ok_or_else(|| Error::Format(format!("{} has no datatype", basename)))?;
    let description = format!(
        "Create item {} of type {}{} from file {}",
        basename,
        tag,
        language
            .as_deref()
            .map(|l| format!("/{}", l))
            .unwrap_or_default(),
        filename.display()
    );
    if dry_run {
        return Ok(Some(description));
    }

    if let Some(item) = &existing {
        paper.delete_item(item)?;
    }

    match tag.as_str() {
        "calclet" | "importlet" | "module" => {
            let text = fs::read_to_string(filename)
                .map_err(|_| Error::Format(format!("{} is not a text file", filename.display())))?;
            let code_rel = basename.trim_start_matches("/code/").to_string();
            paper.store_script(&code_rel, &text, &tag)?;
            set_timestamp(paper, &basename, mtime)?;
        }
        "file" | "text" => {
            let bytes = fs::read(filename)?;
            let mut file = paper.open_internal_file(&basename, "wb", None)?;
            file.write_bytes(&bytes)?;
            file.close()?;
            finish_checked_in_file(paper, &basename, &tag, language.as_deref(), mtime)?;
        }
        other => {
            return Err(Error::Format(format!(
                "cannot check in items of type {}",
                other
            )))
        }
    }
    Ok(None)
}

fn set_timestamp(paper: &ActivePaper, item: &str, mtime: i64) -> Result<()> {
    let mut store = paper.inner_arc().store.lock().unwrap();
    let node = store.require_mut(item)?;
    stamp::timestamp(node, Some(mtime));
    Ok(())
}

fn finish_checked_in_file(
    paper: &ActivePaper,
    item: &str,
    tag: &str,
    language: Option<&str>,
    mtime: i64,
) -> Result<()> {
    let mut store = paper.inner_arc().store.lock().unwrap();
    let node = store.require_mut(item)?;
    stamp::stamp(node, tag, &stamp::StampAttrs::default())?;
    if let Some(language) = language {
        node.attrs.insert(
            stamp::ATTR_LANGUAGE.into(),
            AttrValue::Str(language.to_string()),
        );
    }
    stamp::timestamp(node, Some(mtime));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_heuristics() {
        assert_eq!(extension_for("calclet", Some("rhai")), ".rhai");
        assert_eq!(extension_for("text", Some("LaTeX")), ".tex");
        assert_eq!(extension_for("text", None), ".txt");
        assert_eq!(extension_for("file", None), "");
        assert_eq!(extension_for("text", Some("unknown-lang")), ".txt");
    }

    #[test]
    fn directory_patterns_match_children() {
        let set = build_patterns(&["data/numbers".to_string()]).unwrap();
        assert!(matches(&set, "data/numbers"));
        assert!(matches(&set, "data/numbers/pi"));
        assert!(!matches(&set, "data/other"));
    }

    #[test]
    fn extension_split() {
        assert_eq!(
            split_extension("/code/calc.rhai"),
            ("/code/calc".to_string(), ".rhai".to_string())
        );
        assert_eq!(
            split_extension("/data/plain"),
            ("/data/plain".to_string(), "".to_string())
        );
    }
}
