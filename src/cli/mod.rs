//! The `aptool` command-line interface.
//!
//! - [`command`] — the `Command` enum and per-command option structs
//! - [`parser`] — hand-rolled argument parsing with typo suggestions
//! - [`commands`] — the handlers, one per subcommand
//! - [`files`] — checkin/checkout/extract plumbing shared by handlers

pub mod command;
pub mod commands;
pub mod files;
pub mod parser;

pub use command::{Command, GlobalOptions};
pub use commands::dispatch;
pub use parser::parse;

/// Usage text for `--help`.
pub const USAGE: &str = "\
aptool — manage ActivePaper containers

Usage: aptool [-p PAPER] <command> [options]

Commands:
  create [-d PKG]...                create a new paper
  ls [--long] [--type T] [PATTERN]  list items
  rm [--force] PATTERN...           delete items and their dependents
  dummy [--force] PATTERN...        replace items by zero-sized dummies
  set DATASET EXPR                  set a primary-input dataset
  group NAME                        create a structural group
  extract DATASET FILE              extract one item (FILE may be -)
  calclet PATH FILE [--run]         store (and run) a calclet
  importlet PATH FILE [--run]       store (and run) an importlet
  import_module NAME [DIR]...       store module source from disk
  run CODELET [--debug] [--checkin] run a stored codelet
  update [--verbose]                rerun codelets for stale/dummy items
  checkin [--type T] [--force] [--dry-run] FILE...
  checkout [--type T] [--dry-run] [PATTERN]...
  ln KIND:SCHEME:LABEL[:PATH] NAME  reference an item in another paper
  cp KIND:SCHEME:LABEL[:PATH] NAME  copy an item from another paper
  refs [--verbose]                  list referenced papers

Options:
  -p, --paper PAPER   paper file (default: the single .ap file in .)
  -h, --help          show this help
  -V, --version       show the version
";
