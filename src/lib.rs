//! # activepapers
//!
//! Executable research artifacts: code, input data, derived data and
//! documentation packaged in one self-describing container, with the
//! provenance of every derived item tracked automatically.
//!
//! Computations are expressed as *codelets* — small rhai scripts stored
//! inside the container. While a codelet runs, every dataset it reads,
//! every dataset it writes and every module it imports goes through an
//! intercepting view, so each output ends up stamped with the exact set
//! of items that influenced it. From those stamps the crate derives a
//! dependency graph used for staleness detection, selective recomputation
//! (`update`), and full deterministic rebuilds.
//!
//! ## Quick start (library usage)
//!
//! ```rust,no_run
//! use activepapers::{ActivePaper, Value};
//! use std::path::Path;
//!
//! let paper = ActivePaper::create(Path::new("sine.ap"), &[]).unwrap();
//! paper.set_data("frequency", Value::Float(0.2)).unwrap();
//! paper.set_data("time", Value::FloatArray(
//!     (0..100).map(|i| 0.1 * i as f64).collect())).unwrap();
//!
//! let calc = paper.create_calclet("calc_sine", r#"
//!     import "math" as math;
//!     let frequency = data["frequency"].value;
//!     let time = data["time"].value;
//!     let sine = [];
//!     for t in time {
//!         sine.push(sin(2.0 * math::pi * frequency * t));
//!     }
//!     data.create_dataset("sine", sine);
//! "#).unwrap();
//! calc.run().unwrap();
//! paper.close().unwrap();
//! ```
//!
//! ## CLI usage
//!
//! The `aptool` binary drives papers from the command line:
//!
//! ```bash
//! aptool -p sine.ap create
//! aptool -p sine.ap set frequency 0.2
//! aptool -p sine.ap calclet code/calc_sine calc_sine.rhai --run
//! aptool -p sine.ap ls --long
//! aptool -p sine.ap update
//! ```

pub mod cli;
pub mod code;
pub mod codelet;
pub mod error;
pub mod graph;
pub mod internal_file;
pub mod library;
pub mod modules;
pub mod paper;
pub mod paths;
pub mod stamp;
pub mod store;
pub mod value;
pub mod views;

mod registry;

pub use codelet::{Codelet, CodeletKind};
pub use error::{Error, Result};
pub use internal_file::{Encoding, FileContent, InternalFile, OpenMode};
pub use library::{open_paper_ref, register_doi_fetcher, DoiFetcher};
pub use modules::register_host_package;
pub use paper::ActivePaper;
pub use value::{AttrValue, HistoryEntry, Value};

/// Crate version, recorded in every paper's history.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
