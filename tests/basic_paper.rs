//! End-to-end tests on a very simple paper: one calclet deriving a sine
//! series from two primary inputs, plus the graph queries and a full
//! rebuild.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use activepapers::store::Store;
use activepapers::{ActivePaper, Value};
use tempfile::TempDir;

const CALC_SINE: &str = r#"
import "math" as math;

let frequency = data["frequency"].value;
let time = data["time"].value;
let sine = [];
for t in time {
    sine.push(sin(2.0 * math::pi * frequency * t));
}
data.create_dataset("sine", sine);
"#;

fn make_simple_paper(filename: &Path) {
    let paper = ActivePaper::create(filename, &[]).unwrap();
    paper.set_data("frequency", Value::Float(0.2)).unwrap();
    paper
        .set_data(
            "time",
            Value::FloatArray((0..100).map(|i| 0.1 * i as f64).collect()),
        )
        .unwrap();
    let calc_sine = paper.create_calclet("calc_sine", CALC_SINE).unwrap();
    let traceback = calc_sine.run().unwrap();
    assert!(traceback.is_none(), "calclet failed:\n{}", traceback.unwrap());
    paper.close().unwrap();
}

fn sine_values(paper: &ActivePaper) -> Vec<f64> {
    match paper.get_value("/data/sine").unwrap() {
        Value::FloatArray(v) => v,
        other => panic!("unexpected value {:?}", other),
    }
}

fn check_container_layout(filename: &Path) {
    let store = Store::load(filename).unwrap();
    assert_eq!(
        store.root_attrs.get("DATA_MODEL").unwrap().as_str(),
        Some("active-papers-py")
    );
    assert_eq!(
        store
            .root_attrs
            .get("DATA_MODEL_MAJOR_VERSION")
            .unwrap()
            .as_i64(),
        Some(0)
    );
    assert_eq!(
        store
            .root_attrs
            .get("DATA_MODEL_MINOR_VERSION")
            .unwrap()
            .as_i64(),
        Some(1)
    );
    for group in ["/code", "/data", "/documentation", "/external-dependencies"] {
        assert!(store.get(group).unwrap().is_group(), "{} missing", group);
    }
    let history = match store.get("/history").unwrap().value() {
        Some(Value::History(entries)) => entries.clone(),
        other => panic!("unexpected history {:?}", other),
    };
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert!(entry.opened > 0);
    assert!(entry.closed >= entry.opened);
    assert!(entry.versions.contains_key("activepapers"));
    // Every stamped item was written while the paper was open.
    for path in ["/data/frequency", "/data/time", "/data/sine"] {
        let node = store.get(path).unwrap();
        let t = node
            .attrs
            .get("ACTIVE_PAPER_TIMESTAMP")
            .and_then(|a| a.as_i64())
            .unwrap();
        assert!(t >= entry.opened && t <= entry.closed, "{}: {}", path, t);
    }
}

fn check_paper(filename: &Path) {
    let paper = ActivePaper::open(filename, "r").unwrap();

    let mut items = paper.iter_items();
    items.sort();
    assert_eq!(
        items,
        vec![
            "/code/calc_sine".to_string(),
            "/data/frequency".to_string(),
            "/data/sine".to_string(),
            "/data/time".to_string(),
        ]
    );

    // Dependency completeness on the derived item.
    assert_eq!(
        paper.iter_dependencies("/data/sine"),
        vec![
            "/code/calc_sine".to_string(),
            "/data/frequency".to_string(),
            "/data/time".to_string(),
        ]
    );
    assert_eq!(
        paper.generating_codelet("/data/sine").as_deref(),
        Some("/code/calc_sine")
    );
    assert!(!paper.is_stale("/data/sine"));
    for primary in ["/data/frequency", "/data/time", "/code/calc_sine"] {
        assert!(paper.iter_dependencies(primary).is_empty());
        assert!(paper.generating_codelet(primary).is_none());
    }

    // Graph consistency: the dependency graph is the transpose of
    // iter_dependencies, edge for edge.
    let graph = paper.dependency_graph();
    let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for item in paper.iter_items().into_iter().chain(paper.iter_groups()) {
        for dep in paper.iter_dependencies(&item) {
            expected.entry(dep).or_default().insert(item.clone());
        }
    }
    assert_eq!(graph, expected);
    for (dep, dependents) in &graph {
        for dependent in dependents {
            assert!(paper.iter_dependencies(dependent).contains(dep));
        }
    }

    // Hierarchy: primaries first, the sine afterwards.
    let hierarchy = paper.dependency_hierarchy().unwrap();
    assert_eq!(hierarchy.len(), 2);
    assert_eq!(
        hierarchy[0],
        ["/code/calc_sine", "/data/frequency", "/data/time"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
    );
    assert_eq!(
        hierarchy[1],
        ["/data/sine"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
    );

    let calclets = paper.calclets();
    assert_eq!(calclets.len(), 1);
    assert!(calclets.contains_key("/code/calc_sine"));

    // The numbers themselves.
    let sine = sine_values(&paper);
    assert_eq!(sine.len(), 100);
    let expected_5 = (0.2_f64 * std::f64::consts::PI).sin();
    assert!((sine[5] - expected_5).abs() < 1e-10, "sine[5] = {}", sine[5]);
    assert!((sine[5] - 0.5877852523).abs() < 1e-9);

    paper.close().unwrap();
}

#[test]
fn simple_paper() {
    let tmp = TempDir::new().unwrap();
    let filename = tmp.path().join("simple.ap");
    make_simple_paper(&filename);
    check_container_layout(&filename);
    check_paper(&filename);
}

#[test]
fn rebuild_reproduces_the_paper() {
    let tmp = TempDir::new().unwrap();
    let original = tmp.path().join("simple.ap");
    let clone = tmp.path().join("rebuilt.ap");
    make_simple_paper(&original);

    let paper = ActivePaper::open(&original, "r").unwrap();
    let sine_before = sine_values(&paper);
    paper.rebuild(&clone).unwrap();
    paper.close().unwrap();

    check_paper(&clone);
    let rebuilt = ActivePaper::open(&clone, "r").unwrap();
    let sine_after = sine_values(&rebuilt);
    let max_diff = sine_before
        .iter()
        .zip(&sine_after)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f64, f64::max);
    assert!(max_diff < 1e-10, "max diff {}", max_diff);

    // Primary inputs keep their timestamps across the rebuild.
    let source = ActivePaper::open(&original, "r").unwrap();
    for primary in ["/data/frequency", "/data/time"] {
        assert_eq!(
            source.timestamp_of(primary),
            rebuilt.timestamp_of(primary),
            "{} timestamp changed",
            primary
        );
    }
    source.close().unwrap();
    rebuilt.close().unwrap();
}

#[test]
fn reopening_appends_history() {
    let tmp = TempDir::new().unwrap();
    let filename = tmp.path().join("history.ap");
    make_simple_paper(&filename);
    let paper = ActivePaper::open(&filename, "r+").unwrap();
    paper.close().unwrap();
    let store = Store::load(&filename).unwrap();
    match store.get("/history").unwrap().value() {
        Some(Value::History(entries)) => {
            assert_eq!(entries.len(), 2);
            assert!(entries.iter().all(|e| e.closed >= e.opened));
        }
        other => panic!("unexpected history {:?}", other),
    }
}
