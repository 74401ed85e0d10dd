//! Import behaviour: in-paper modules, the whitelist, and host packages.

use activepapers::{register_host_package, ActivePaper, Value};
use serial_test::serial;
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

#[test]
fn internal_module_is_importable_and_recorded_as_dependency() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("modules.ap"), &[]).unwrap();
    paper
        .add_module(
            "my_math",
            r#"
fn my_func(x) {
    sin(x)
}
"#,
        )
        .unwrap();
    assert_eq!(
        paper.get_local_module("my_math").as_deref(),
        Some("/code/python-packages/my_math")
    );
    assert_eq!(
        paper.datatype_of("/code/python-packages/my_math").as_deref(),
        Some("module")
    );

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
import "my_math" as m;
import "math" as math;

let frequency = data["frequency"].value;
let time = data["time"].value;
let sine = [];
for t in time {
    sine.push(m::my_func(2.0 * math::pi * frequency * t));
}
data.create_dataset("sine", sine);
"#,
        )
        .unwrap();
    run_ok(&paper, "calc_sine");

    let deps = paper.iter_dependencies("/data/sine");
    assert_eq!(
        deps,
        vec![
            "/code/calc_sine".to_string(),
            "/code/python-packages/my_math".to_string(),
            "/data/frequency".to_string(),
            "/data/time".to_string(),
        ]
    );
    paper.close().unwrap();
}

#[test]
fn unknown_import_is_forbidden_for_calclets() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("forbidden.ap"), &[]).unwrap();
    paper
        .create_calclet("bad_import", r#"import "distutils" as d;"#)
        .unwrap();
    let traceback = paper.run_codelet("bad_import", false).unwrap().unwrap();
    assert!(
        traceback.contains("import of distutils not allowed"),
        "unexpected traceback:\n{}",
        traceback
    );
    paper.close().unwrap();
}

#[test]
fn builtin_modules_need_no_declaration() {
    let tmp = TempDir::new().unwrap();
    let paper = ActivePaper::create(&tmp.path().join("builtin.ap"), &[]).unwrap();
    paper
        .create_calclet(
            "use_math",
            r#"
import "math" as math;
data.create_dataset("pi", math::pi);
"#,
        )
        .unwrap();
    run_ok(&paper, "use_math");
    match paper.get_value("/data/pi").unwrap() {
        Value::Float(x) => assert_eq!(x, std::f64::consts::PI),
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();
}

#[test]
#[serial]
fn declared_host_packages_import_and_undeclared_ones_do_not() {
    let mut module = rhai::Module::new();
    module.set_native_fn("square", |x: f64| Ok(x * x));
    register_host_package("numerics", module, "1.0.0");

    let tmp = TempDir::new().unwrap();
    let declared = ActivePaper::create(
        &tmp.path().join("declared.ap"),
        &["numerics".to_string()],
    )
    .unwrap();
    declared
        .create_calclet(
            "use_host",
            r#"
import "numerics" as n;
data.create_dataset("squared", n::square(3.0));
"#,
        )
        .unwrap();
    run_ok(&declared, "use_host");
    match declared.get_value("/data/squared").unwrap() {
        Value::Float(x) => assert_eq!(x, 9.0),
        other => panic!("unexpected value {:?}", other),
    }
    declared.close().unwrap();

    let undeclared = ActivePaper::create(&tmp.path().join("undeclared.ap"), &[]).unwrap();
    undeclared
        .create_calclet(
            "use_host",
            r#"
import "numerics" as n;
data.create_dataset("squared", n::square(3.0));
"#,
        )
        .unwrap();
    let traceback = undeclared.run_codelet("use_host", false).unwrap().unwrap();
    assert!(
        traceback.contains("import of numerics not allowed"),
        "unexpected traceback:\n{}",
        traceback
    );
    undeclared.close().unwrap();
}

#[test]
#[serial]
fn importlets_bypass_the_whitelist() {
    let mut module = rhai::Module::new();
    module.set_native_fn("constant", || Ok(17.0_f64));
    register_host_package("measurements", module, "0.3.1");

    let tmp = TempDir::new().unwrap();
    // The paper does not declare "measurements"; an importlet may still
    // use it, its results being non-reproducible by contract.
    let paper = ActivePaper::create(&tmp.path().join("importlet.ap"), &[]).unwrap();
    paper
        .create_importlet(
            "ingest",
            r#"
import "measurements" as m;
data.create_dataset("reading", m::constant());
"#,
        )
        .unwrap();
    run_ok(&paper, "ingest");
    match paper.get_value("/data/reading").unwrap() {
        Value::Float(x) => assert_eq!(x, 17.0),
        other => panic!("unexpected value {:?}", other),
    }
    // Importlet outputs carry their creator but no dependency list.
    assert_eq!(
        paper.generating_codelet("/data/reading").as_deref(),
        Some("/code/ingest")
    );
    assert!(paper.iter_dependencies("/data/reading").is_empty());
    paper.close().unwrap();
}

#[test]
fn declaring_an_unregistered_package_fails_at_create() {
    let tmp = TempDir::new().unwrap();
    let result = ActivePaper::create(
        &tmp.path().join("missing.ap"),
        &["no-such-package".to_string()],
    );
    assert!(result.is_err());
}

#[test]
fn import_module_from_the_host_file_system() {
    let tmp = TempDir::new().unwrap();
    let module_dir = tmp.path().join("src");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(
        module_dir.join("helpers.rhai"),
        "fn triple(x) { 3 * x }\n",
    )
    .unwrap();

    let paper = ActivePaper::create(&tmp.path().join("imported.ap"), &[]).unwrap();
    paper
        .import_module("helpers", &[module_dir.clone()])
        .unwrap();
    assert!(paper.contains("/code/python-packages/helpers"));

    paper
        .create_calclet(
            "use_helpers",
            r#"
import "helpers" as h;
data.create_dataset("nine", h::triple(3));
"#,
        )
        .unwrap();
    run_ok(&paper, "use_helpers");
    match paper.get_value("/data/nine").unwrap() {
        Value::Int(x) => assert_eq!(x, 9),
        other => panic!("unexpected value {:?}", other),
    }
    paper.close().unwrap();

    // Missing modules are reported as such.
    let paper = ActivePaper::create(&tmp.path().join("imported2.ap"), &[]).unwrap();
    assert!(paper.import_module("nonexistent", &[module_dir]).is_err());
    paper.close().unwrap();
}
