//! Provenance stamping: the reserved attributes, their legal transitions,
//! and the monotonic millisecond clock.
//!
//! Every item carries up to four reserved attributes (datatype tag,
//! timestamp, generating codelet, dependency list) plus a few secondary
//! ones. String-valued reserved attributes are immutable once written,
//! with a short allow-list of tag transitions as the only exception.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{Error, Result};
use crate::store::Node;
use crate::value::AttrValue;

/// Prefix shared by every reserved attribute; anything starting with it is
/// hidden from user code.
pub const RESERVED_PREFIX: &str = "ACTIVE_PAPER";

pub const ATTR_DATATYPE: &str = "ACTIVE_PAPER_DATATYPE";
pub const ATTR_TIMESTAMP: &str = "ACTIVE_PAPER_TIMESTAMP";
pub const ATTR_GENERATING_CODELET: &str = "ACTIVE_PAPER_GENERATING_CODELET";
pub const ATTR_DEPENDENCIES: &str = "ACTIVE_PAPER_DEPENDENCIES";
pub const ATTR_LANGUAGE: &str = "ACTIVE_PAPER_LANGUAGE";
pub const ATTR_COPIED_FROM: &str = "ACTIVE_PAPER_COPIED_FROM";
pub const ATTR_DUMMY: &str = "ACTIVE_PAPER_DUMMY_DATASET";

/// Tag transitions that may happen after the first stamp. Everything else
/// is frozen.
const ALLOWED_TRANSITIONS: &[(&str, &str)] =
    &[("group", "data"), ("data", "group"), ("file", "text")];

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Milliseconds since the epoch, never going backwards within a process.
pub fn ms_since_epoch() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = chrono::Utc::now().timestamp_millis();
    let prev = LAST.fetch_max(now, Ordering::SeqCst);
    now.max(prev)
}

/// Provenance payload attached by a stamp: who wrote the item and what it
/// was derived from.
#[derive(Debug, Clone, Default)]
pub struct StampAttrs {
    pub generating_codelet: Option<String>,
    pub dependencies: Option<Vec<String>>,
}

/// Read the datatype tag of a node.
pub fn datatype(node: &Node) -> Option<&str> {
    node.attrs.get(ATTR_DATATYPE).and_then(|a| a.as_str())
}

/// Read the generating codelet of a node (its owner), if any.
pub fn owner(node: &Node) -> Option<&str> {
    node.attrs
        .get(ATTR_GENERATING_CODELET)
        .and_then(|a| a.as_str())
}

/// Modification time in ms since the epoch.
pub fn mod_time(node: &Node) -> Option<i64> {
    node.attrs.get(ATTR_TIMESTAMP).and_then(|a| a.as_i64())
}

pub fn dependencies(node: &Node) -> Vec<String> {
    node.attrs
        .get(ATTR_DEPENDENCIES)
        .and_then(|a| a.as_str_list())
        .map(|l| l.to_vec())
        .unwrap_or_default()
}

pub fn language(node: &Node) -> Option<&str> {
    node.attrs.get(ATTR_LANGUAGE).and_then(|a| a.as_str())
}

pub fn is_dummy(node: &Node) -> bool {
    node.attrs
        .get(ATTR_DUMMY)
        .and_then(|a| a.as_bool())
        .unwrap_or(false)
}

/// Set or refresh the timestamp. `t` is ms since the epoch; `None` means
/// "now".
pub fn timestamp(node: &mut Node, t: Option<i64>) {
    let t = t.unwrap_or_else(ms_since_epoch);
    node.attrs.insert(ATTR_TIMESTAMP.into(), AttrValue::Int(t));
}

fn set_immutable_str(node: &mut Node, key: &str, value: &str) -> Result<()> {
    match node.attrs.get(key).and_then(|a| a.as_str()) {
        None => {
            node.attrs
                .insert(key.to_string(), AttrValue::Str(value.to_string()));
            Ok(())
        }
        Some(previous) if previous == value => Ok(()),
        Some(previous) => {
            if key == ATTR_DATATYPE
                && ALLOWED_TRANSITIONS.contains(&(previous, value))
            {
                node.attrs
                    .insert(key.to_string(), AttrValue::Str(value.to_string()));
                Ok(())
            } else {
                Err(Error::Invariant(format!(
                    "{}: {} != {}",
                    key, value, previous
                )))
            }
        }
    }
}

/// Stamp a node: set its datatype tag, the provenance attributes, and a
/// fresh timestamp.
///
/// The dependency list is always rewritten (sorted); the tag and the
/// generating codelet are immutable once present, apart from the allowed
/// tag transitions.
pub fn stamp(node: &mut Node, tag: &str, attrs: &StampAttrs) -> Result<()> {
    set_immutable_str(node, ATTR_DATATYPE, tag)?;
    if let Some(codelet) = &attrs.generating_codelet {
        set_immutable_str(node, ATTR_GENERATING_CODELET, codelet)?;
    }
    if let Some(deps) = &attrs.dependencies {
        let mut deps = deps.clone();
        deps.sort();
        node.attrs
            .insert(ATTR_DEPENDENCIES.into(), AttrValue::StrList(deps));
    }
    timestamp(node, None);
    Ok(())
}

/// Remove the provenance attributes (generating codelet and dependency
/// list) from a node. Used when a copy becomes a primary input.
pub fn strip_provenance(node: &mut Node) {
    node.attrs.remove(ATTR_GENERATING_CODELET);
    node.attrs.remove(ATTR_DEPENDENCIES);
}
