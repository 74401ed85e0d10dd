//! Command enum and option types for the `aptool` CLI.
//!
//! The `Command` enum is the source of truth for all subcommands and backs
//! both the parser and the help output.

use std::path::PathBuf;

/// Options shared by all commands.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Paper file to operate on; defaults to the single `*.ap` file in the
    /// working directory.
    pub paper: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Create a new, empty paper.
    Create(CreateOptions),
    /// List items.
    Ls(LsOptions),
    /// Delete items and everything depending on them.
    Rm(PatternOptions),
    /// Replace items by zero-sized dummies that keep their provenance.
    Dummy(PatternOptions),
    /// Set a primary-input dataset from an expression.
    Set(SetOptions),
    /// Create a structural group.
    Group(GroupOptions),
    /// Extract one item to a file (or stdout).
    Extract(ExtractOptions),
    /// Store a calclet from a script file.
    Calclet(ScriptOptions),
    /// Store an importlet from a script file.
    Importlet(ScriptOptions),
    /// Import module source from the host file system.
    ImportModule(ImportModuleOptions),
    /// Run a stored codelet.
    Run(RunOptions),
    /// Re-run codelets until no item is stale or dummy.
    Update(UpdateOptions),
    /// Update items from files in the working directory.
    Checkin(CheckinOptions),
    /// Extract items into the working directory.
    Checkout(CheckoutOptions),
    /// Create a reference to an item in another paper.
    Ln(LinkOptions),
    /// Copy an item from another paper.
    Cp(LinkOptions),
    /// List the papers referenced by this one.
    Refs(RefsOptions),
    Help,
    Version,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// External packages the paper declares (`-d NAME`, repeatable).
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LsOptions {
    pub long: bool,
    pub datatype: Option<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PatternOptions {
    pub force: bool,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SetOptions {
    pub dataset: String,
    pub expr: String,
}

#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub dataset: String,
    /// Output file name; `-` writes to stdout.
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Item path under `/code`.
    pub path: String,
    /// Host file holding the script source.
    pub file: PathBuf,
    /// Run the codelet right after storing it.
    pub run: bool,
}

#[derive(Debug, Clone)]
pub struct ImportModuleOptions {
    pub name: String,
    /// Search roots; defaults to the working directory.
    pub search: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub codelet: String,
    /// Raise codelet failures instead of printing the traceback.
    pub debug: bool,
    /// Check in the `code/` directory before running.
    pub checkin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CheckinOptions {
    pub datatype: Option<String>,
    pub force: bool,
    pub dry_run: bool,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutOptions {
    pub datatype: Option<String>,
    pub dry_run: bool,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Fully qualified reference: `kind:scheme:label[:path]`.
    pub reference: String,
    /// Local item name.
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RefsOptions {
    pub verbose: bool,
}
