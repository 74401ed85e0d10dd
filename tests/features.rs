//! Feature tests: item-marked groups, internal files, ownership rules,
//! dummies, staleness and hidden attributes.

use std::collections::BTreeSet;
use std::path::Path;

use activepapers::{ActivePaper, Value};
use tempfile::TempDir;

fn run_ok(paper: &ActivePaper, path: &str) {
    let traceback = paper.run_codelet(path, false).unwrap();
    assert!(
        traceback.is_none(),
        "{} failed:\n{}",
        path,
        traceback.unwrap()
    );
}

fn run_err(paper: &ActivePaper, path: &str) -> String {
    paper
        .run_codelet(path, false)
        .unwrap()
        .unwrap_or_else(|| panic!("{} unexpectedly succeeded", path))
}

// ============================================
// Groups as data items
// ============================================

#[test]
fn group_marked_as_data_item_is_one_dependency_unit() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("groups.ap"), &[]).unwrap();

    paper
        .create_calclet(
            "script1",
            r#"
import "math" as math;
let numbers = data.create_group("numbers");
numbers.mark_as_data_item();
numbers.create_dataset("pi", math::pi);
numbers.create_dataset("e", math::e);
"#,
        )
        .unwrap();
    run_ok(&paper, "script1");

    paper
        .create_calclet(
            "script2",
            r#"
let numbers = data["numbers"];
let product = numbers["pi"].value * numbers["e"].value;
data.create_dataset("result", product);
"#,
        )
        .unwrap();
    run_ok(&paper, "script2");

    // The whole group is the dependency, never its members.
    let deps = paper.iter_dependencies("/data/result");
    assert!(deps.contains(&"/data/numbers".to_string()), "{:?}", deps);
    assert!(!deps.iter().any(|d| d.starts_with("/data/numbers/")));
    // Derived data also depends on the generating code.
    assert!(deps.contains(&"/code/script1".to_string()));
    assert!(deps.contains(&"/code/script2".to_string()));

    // Members of an item-marked group are not items themselves.
    let items: BTreeSet<String> = paper.iter_items().into_iter().collect();
    assert!(items.contains("/data/numbers"));
    assert!(!items.contains("/data/numbers/pi"));
    assert!(!items.contains("/data/numbers/e"));

    match paper.get_value("/data/result").unwrap() {
        Value::Float(x) => {
            assert!((x - std::f64::consts::PI * std::f64::consts::E).abs() < 1e-12)
        }
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();
}

// ============================================
// Internal files
// ============================================

fn internal_file_paper(dir: &Path) -> ActivePaper {
    let paper = ActivePaper::create(&dir.join("files.ap"), &[]).unwrap();
    paper
        .create_calclet(
            "write",
            r#"
let f = open("numbers", "w");
for i in 0..10 {
    f.write(i.to_string() + "\n");
}
f.close();
"#,
        )
        .unwrap();
    run_ok(&paper, "write");
    paper
}

#[test]
fn internal_file_round_trip() {
    let tmp = TempDir::new().unwrap();
    let paper = internal_file_paper(tmp.path());

    paper
        .create_calclet(
            "read_lines",
            r#"
let f = open("numbers");
for i in 0..10 {
    let line = f.readline();
    if line != i.to_string() + "\n" {
        throw "line mismatch: " + line;
    }
}
if f.readline() != "" {
    throw "expected end of file";
}
f.close();
"#,
        )
        .unwrap();
    run_ok(&paper, "read_lines");

    paper
        .create_calclet(
            "read_all",
            r#"
let f = open("numbers");
let text = f.read();
f.close();
let parts = text.split("\n");
if parts.len != 11 {
    throw "unexpected split count";
}
for i in 0..10 {
    if parts[i] != i.to_string() {
        throw "part mismatch";
    }
}
"#,
        )
        .unwrap();
    run_ok(&paper, "read_all");

    paper
        .create_calclet(
            "convert_to_binary",
            r#"
import "bytes" as bytes;
let f = open("numbers");
let values = [];
for line in f.readlines() {
    values.push(parse_int(line.sub_string(0, line.len - 1)));
}
f.close();
let out = open("binary_numbers", "wb");
out.write(bytes::pack_i16_be(values));
out.close();
"#,
        )
        .unwrap();
    run_ok(&paper, "convert_to_binary");

    paper
        .create_calclet(
            "read_binary",
            r#"
import "bytes" as bytes;
let f = open("binary_numbers", "rb");
let blob = f.read();
f.close();
let values = bytes::unpack_i16_be(blob);
if values != [0, 1, 2, 3, 4, 5, 6, 7, 8, 9] {
    throw "unexpected values";
}
"#,
        )
        .unwrap();
    run_ok(&paper, "read_binary");

    // binary_numbers carries the file and its reader as provenance.
    let deps = paper.iter_dependencies("/data/binary_numbers");
    assert!(deps.contains(&"/data/numbers".to_string()), "{:?}", deps);
    assert!(deps.contains(&"/code/convert_to_binary".to_string()));

    match paper.get_value("/data/binary_numbers").unwrap() {
        Value::Bytes(b) => assert_eq!(b.len(), 20),
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();
}

#[test]
fn little_endian_packing_differs_from_big_endian() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("endian.ap"), &[]).unwrap();
    paper
        .create_calclet(
            "pack",
            r#"
import "bytes" as bytes;
let values = [1, 256];
let le = bytes::pack_i16_le(values);
let be = bytes::pack_i16_be(values);
if le == be {
    throw "endianness ignored";
}
if bytes::unpack_i16_le(le) != values {
    throw "little-endian round trip failed";
}
if bytes::unpack_i16_be(be) != values {
    throw "big-endian round trip failed";
}
"#,
        )
        .unwrap();
    run_ok(&paper, "pack");
    paper.close().unwrap();
}

// ============================================
// Ownership
// ============================================

#[test]
fn overwriting_a_foreign_internal_file_is_denied() {
    let tmp = TempDir::new().unwrap();
    let paper = internal_file_paper(tmp.path());

    paper
        .create_calclet(
            "hijack",
            r#"
let f = open("numbers", "w");
f.write("gone\n");
f.close();
"#,
        )
        .unwrap();
    let traceback = run_err(&paper, "hijack");
    assert!(
        traceback.contains("permission denied"),
        "unexpected traceback:\n{}",
        traceback
    );

    // The original content is intact.
    let mut file = paper.open_internal_file("data/numbers", "r", None).unwrap();
    let lines = file.readlines().unwrap();
    assert_eq!(lines.len(), 10);
    paper.close().unwrap();
}

#[test]
fn deleting_or_overwriting_foreign_items_is_denied() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("owners.ap"), &[]).unwrap();
    paper.set_data("frequency", Value::Float(0.2)).unwrap();
    paper
        .create_calclet(
            "producer",
            r#"data.create_dataset("product", 42.0);"#,
        )
        .unwrap();
    run_ok(&paper, "producer");

    paper
        .create_calclet("thief_delete", r#"data.remove("frequency");"#)
        .unwrap();
    let traceback = run_err(&paper, "thief_delete");
    assert!(traceback.contains("permission denied"), "{}", traceback);
    assert!(paper.contains("/data/frequency"));

    paper
        .create_calclet(
            "thief_overwrite",
            r#"data.require_dataset("product", 0.0);"#,
        )
        .unwrap();
    let traceback = run_err(&paper, "thief_overwrite");
    assert!(traceback.contains("invariant violation"), "{}", traceback);
    match paper.get_value("/data/product").unwrap() {
        Value::Float(x) => assert_eq!(x, 42.0),
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();
}

// ============================================
// Dummies and update
// ============================================

#[test]
fn dummy_preserves_provenance_and_update_restores_data() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("dummy.ap"), &[]).unwrap();
    paper.set_data("frequency", Value::Float(0.2)).unwrap();
    paper
        .set_data(
            "time",
            Value::FloatArray((0..100).map(|i| 0.1 * i as f64).collect()),
        )
        .unwrap();
    paper
        .create_calclet(
            "calc_sine",
            r#"
import "math" as math;
let frequency = data["frequency"].value;
let time = data["time"].value;
let sine = [];
for t in time {
    sine.push(sin(2.0 * math::pi * frequency * t));
}
data.create_dataset("sine", sine);
"#,
        )
        .unwrap();
    run_ok(&paper, "calc_sine");

    let original = match paper.get_value("/data/sine").unwrap() {
        Value::FloatArray(v) => v,
        other => panic!("unexpected value {:?}", other),
    };
    let deps_before = paper.iter_dependencies("/data/sine");
    let time_before = paper.timestamp_of("/data/sine").unwrap();

    // Primary inputs cannot be replaced by dummies.
    assert!(paper.replace_by_dummy("/data/frequency").is_err());

    paper.replace_by_dummy("/data/sine").unwrap();
    assert!(paper.is_dummy("/data/sine"));
    match paper.get_value("/data/sine").unwrap() {
        Value::Bytes(b) => assert!(b.is_empty()),
        other => panic!("unexpected value {:?}", other),
    }
    assert_eq!(paper.iter_dependencies("/data/sine"), deps_before);
    assert_eq!(
        paper.generating_codelet("/data/sine").as_deref(),
        Some("/code/calc_sine")
    );
    assert_eq!(paper.timestamp_of("/data/sine"), Some(time_before));

    // The update cycle: find the dummy, rerun its codelet.
    let hierarchy = paper.dependency_hierarchy().unwrap();
    let mut codelet = None;
    for layer in hierarchy.iter().skip(1) {
        for item in layer {
            if paper.is_dummy(item) || paper.is_stale(item) {
                codelet = paper.generating_codelet(item);
            }
        }
    }
    assert_eq!(codelet.as_deref(), Some("/code/calc_sine"));
    run_ok(&paper, &codelet.unwrap());

    assert!(!paper.is_dummy("/data/sine"));
    match paper.get_value("/data/sine").unwrap() {
        Value::FloatArray(v) => assert_eq!(v, original),
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();
}

// ============================================
// Staleness
// ============================================

#[test]
fn mutating_a_dependency_makes_derived_items_stale() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("stale.ap"), &[]).unwrap();
    paper.set_data("a", Value::Float(1.0)).unwrap();
    paper
        .create_calclet("double", r#"data.create_dataset("b", data["a"].value * 2.0);"#)
        .unwrap();
    run_ok(&paper, "double");
    paper
        .create_calclet("square", r#"data.create_dataset("c", data["b"].value * data["b"].value);"#)
        .unwrap();
    run_ok(&paper, "square");

    assert!(!paper.is_stale("/data/b"));
    assert!(!paper.is_stale("/data/c"));

    // Touch the primary input.
    std::thread::sleep(std::time::Duration::from_millis(2));
    paper.delete_item("/data/a").unwrap();
    paper.set_data("a", Value::Float(3.0)).unwrap();

    assert!(paper.is_stale("/data/b"));
    // c depends on b, whose timestamp has not moved yet; after rerunning
    // the first codelet, staleness propagates one step further.
    run_ok(&paper, "double");
    assert!(!paper.is_stale("/data/b"));
    assert!(paper.is_stale("/data/c"));
    run_ok(&paper, "square");
    assert!(!paper.is_stale("/data/c"));
    match paper.get_value("/data/c").unwrap() {
        Value::Float(x) => assert_eq!(x, 36.0),
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();
}

// ============================================
// Hidden attributes
// ============================================

#[test]
fn reserved_attributes_are_invisible_and_immutable() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("attrs.ap"), &[]).unwrap();
    paper.set_data("x", Value::Float(1.0)).unwrap();

    paper
        .create_calclet(
            "inspect",
            r#"
let ds = data["x"];
if "ACTIVE_PAPER_TIMESTAMP" in ds.attrs {
    throw "reserved attribute visible via contains";
}
if ds.attrs.keys().len() != 0 {
    throw "reserved attributes visible via keys";
}
ds.attrs["note"] = "hello";
if !("note" in ds.attrs) {
    throw "user attribute lost";
}
if ds.attrs["note"] != "hello" {
    throw "user attribute corrupted";
}
"#,
        )
        .unwrap();
    run_ok(&paper, "inspect");

    paper
        .create_calclet(
            "tamper",
            r#"data["x"].attrs["ACTIVE_PAPER_DATATYPE"] = "calclet";"#,
        )
        .unwrap();
    let traceback = run_err(&paper, "tamper");
    assert!(traceback.contains("reserved"), "{}", traceback);
    assert_eq!(paper.datatype_of("/data/x").as_deref(), Some("data"));
    paper.close().unwrap();
}
