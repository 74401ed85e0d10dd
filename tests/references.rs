//! Cross-paper references, copies and the local library.

use std::path::{Path, PathBuf};

use activepapers::{open_paper_ref, ActivePaper, Value};
use serial_test::serial;
use tempfile::TempDir;

/// Build a library with one published paper and point
/// ACTIVEPAPERS_LIBRARY at it. Returns the library root.
fn setup_library(dir: &Path) -> PathBuf {
    let root = dir.join("library");
    std::fs::create_dir_all(root.join("local")).unwrap();
    let published = root.join("local").join("source-paper.ap");
    let paper = ActivePaper::create(&published, &[]).unwrap();
    paper.set_data("frequency", Value::Float(0.2)).unwrap();
    paper
        .set_data("time", Value::FloatArray(vec![0.0, 0.1, 0.2]))
        .unwrap();
    paper.add_module("shared_math", "fn twice(x) { 2.0 * x }\n").unwrap();
    paper.close().unwrap();
    std::env::set_var("ACTIVEPAPERS_LIBRARY", &root);
    root
}

#[test]
#[serial]
fn data_references_resolve_through_the_library() {
    let tmp = TempDir::new().unwrap();
    setup_library(tmp.path());

    let paper = ActivePaper::create(&tmp.path().join("citing.ap"), &[]).unwrap();
    paper
        .create_data_ref("frequency", "local:source-paper", None)
        .unwrap();
    assert_eq!(
        paper.datatype_of("/data/frequency").as_deref(),
        Some("reference")
    );

    // Reading through the data view lands in the referenced paper.
    let resolved = paper.data().lookup("frequency").unwrap();
    match resolved {
        activepapers::views::Resolved::Dataset(ds) => {
            assert_eq!(ds.value().unwrap(), Value::Float(0.2));
        }
        _ => panic!("expected a dataset behind the reference"),
    }

    // A calclet can read it like local data.
    paper
        .create_calclet(
            "use_reference",
            r#"data.create_dataset("doubled", data["frequency"].value * 2.0);"#,
        )
        .unwrap();
    let traceback = paper.run_codelet("use_reference", false).unwrap();
    assert!(traceback.is_none(), "{}", traceback.unwrap());
    assert_eq!(
        paper.get_value("/data/doubled").unwrap(),
        Value::Float(0.4)
    );
    paper.close().unwrap();
}

#[test]
#[serial]
fn creating_a_reference_to_a_missing_item_fails() {
    let tmp = TempDir::new().unwrap();
    setup_library(tmp.path());
    let paper = ActivePaper::create(&tmp.path().join("bad-ref.ap"), &[]).unwrap();
    assert!(paper
        .create_data_ref("nonexistent", "local:source-paper", None)
        .is_err());
    assert!(paper
        .create_data_ref("frequency", "local:no-such-paper", None)
        .is_err());
    paper.close().unwrap();
}

#[test]
#[serial]
fn copies_become_primary_inputs_with_bookkeeping() {
    let tmp = TempDir::new().unwrap();
    let root = setup_library(tmp.path());
    let source_file = root.join("local").join("source-paper.ap");
    let source = ActivePaper::open(&source_file, "r").unwrap();
    let source_time = source.timestamp_of("/data/time").unwrap();
    source.close().unwrap();

    let paper = ActivePaper::create(&tmp.path().join("copying.ap"), &[]).unwrap();
    paper
        .create_copy("data/time", "local:source-paper", None)
        .unwrap();

    assert_eq!(
        paper.get_value("/data/time").unwrap(),
        Value::FloatArray(vec![0.0, 0.1, 0.2])
    );
    // The copy is a primary input with the source's timestamp.
    assert!(paper.generating_codelet("/data/time").is_none());
    assert!(paper.iter_dependencies("/data/time").is_empty());
    assert_eq!(paper.timestamp_of("/data/time"), Some(source_time));

    let refs = paper.external_references();
    let (links, copies) = &refs["local:source-paper"];
    assert!(links.is_empty());
    assert!(copies.contains("/data/time"));
    paper.close().unwrap();
}

#[test]
#[serial]
fn external_references_lists_links_and_copies() {
    let tmp = TempDir::new().unwrap();
    setup_library(tmp.path());

    let paper = ActivePaper::create(&tmp.path().join("refs.ap"), &[]).unwrap();
    paper
        .create_data_ref("frequency", "local:source-paper", None)
        .unwrap();
    paper
        .create_module_ref("shared_math", "local:source-paper", None)
        .unwrap();
    paper
        .create_copy("data/time", "local:source-paper", None)
        .unwrap();

    let refs = paper.external_references();
    assert_eq!(refs.len(), 1);
    let (links, copies) = &refs["local:source-paper"];
    assert!(links.contains("/data/frequency"));
    assert!(links.contains("/code/python-packages/shared_math"));
    assert!(copies.contains("/data/time"));
    paper.close().unwrap();
}

#[test]
#[serial]
fn referenced_module_is_importable() {
    let tmp = TempDir::new().unwrap();
    setup_library(tmp.path());

    let paper = ActivePaper::create(&tmp.path().join("modref.ap"), &[]).unwrap();
    paper
        .create_module_ref("shared_math", "local:source-paper", None)
        .unwrap();
    paper
        .create_calclet(
            "use_shared",
            r#"
import "shared_math" as m;
data.create_dataset("four", m::twice(2.0));
"#,
        )
        .unwrap();
    let traceback = paper.run_codelet("use_shared", false).unwrap();
    assert!(traceback.is_none(), "{}", traceback.unwrap());
    assert_eq!(paper.get_value("/data/four").unwrap(), Value::Float(4.0));

    // A module resolved through a reference lives in a foreign paper and
    // is not a local dependency.
    let deps = paper.iter_dependencies("/data/four");
    assert!(
        !deps.iter().any(|d| d.contains("shared_math")),
        "{:?}",
        deps
    );
    paper.close().unwrap();
}

#[test]
#[serial]
fn library_papers_are_shared_process_wide() {
    let tmp = TempDir::new().unwrap();
    setup_library(tmp.path());
    let first = open_paper_ref("local:source-paper").unwrap();
    let second = open_paper_ref("local:source-paper").unwrap();
    assert_eq!(first.filename(), second.filename());
    // Both handles observe the same open paper.
    assert!(first.is_open() && second.is_open());
}

#[test]
#[serial]
fn doi_without_fetcher_fails_with_reference_error() {
    let tmp = TempDir::new().unwrap();
    setup_library(tmp.path());
    let err = activepapers::library::find_in_library("doi:10.9999/nothing").unwrap_err();
    assert!(matches!(err, activepapers::Error::Reference(_)), "{}", err);
}
