//! Command handlers for the `aptool` CLI.

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use chrono::TimeZone;
use colored::Colorize;

use crate::paper::ActivePaper;
use crate::value::Value;

use super::command::*;
use super::files::{self, ExtractTarget};

/// Resolve the paper file: the `-p` option, or the single `*.ap` file in
/// the working directory.
fn get_paper(global: &GlobalOptions) -> anyhow::Result<PathBuf> {
    if let Some(paper) = &global.paper {
        return Ok(paper.clone());
    }
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(".")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".ap") && entry.file_type()?.is_file() {
            candidates.push(PathBuf::from(name.to_string()));
        }
    }
    match candidates.len() {
        1 => Ok(candidates.remove(0)),
        0 => bail!("no paper given and no .ap file in the current directory"),
        n => bail!("no paper given and {} .ap files in the current directory", n),
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let stdin = std::io::stdin();
    loop {
        print!("{} (y/n) ", prompt);
        std::io::stdout().flush()?;
        let mut reply = String::new();
        if stdin.lock().read_line(&mut reply)? == 0 {
            return Ok(false);
        }
        match reply.trim() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => continue,
        }
    }
}

fn item_display_type(paper: &ActivePaper, item: &str) -> String {
    if paper.is_dummy(item) {
        return "dummy".to_string();
    }
    paper.datatype_of(item).unwrap_or_default()
}

pub fn dispatch(global: &GlobalOptions, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create(opts) => create(global, opts),
        Command::Ls(opts) => ls(global, opts),
        Command::Rm(opts) => rm(global, opts),
        Command::Dummy(opts) => dummy(global, opts),
        Command::Set(opts) => set(global, opts),
        Command::Group(opts) => group(global, opts),
        Command::Extract(opts) => extract(global, opts),
        Command::Calclet(opts) => script(global, opts, false),
        Command::Importlet(opts) => script(global, opts, true),
        Command::ImportModule(opts) => import_module(global, opts),
        Command::Run(opts) => run(global, opts),
        Command::Update(opts) => update(global, opts),
        Command::Checkin(opts) => checkin(global, opts),
        Command::Checkout(opts) => checkout(global, opts),
        Command::Ln(opts) => ln(global, opts),
        Command::Cp(opts) => cp(global, opts),
        Command::Refs(opts) => refs(global, opts),
        Command::Help | Command::Version => unreachable!("handled by the binary"),
    }
}

fn create(global: &GlobalOptions, opts: CreateOptions) -> anyhow::Result<()> {
    let paper = global
        .paper
        .clone()
        .ok_or_else(|| anyhow!("create needs a paper file (-p)"))?;
    ActivePaper::create(&paper, &opts.packages)?.close()?;
    Ok(())
}

fn ls(global: &GlobalOptions, opts: LsOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r")?;
    let patterns = files::build_patterns(&opts.patterns)?;
    for item in paper.iter_items() {
        let name = item.trim_start_matches('/');
        if !files::matches(&patterns, name) {
            continue;
        }
        let dtype = item_display_type(&paper, &item);
        if let Some(wanted) = &opts.datatype {
            if dtype != *wanted {
                continue;
            }
        }
        if opts.long {
            match paper.timestamp_of(&item) {
                Some(t) => {
                    let local = chrono::Local
                        .timestamp_millis_opt(t)
                        .single()
                        .map(|dt| dt.format("%Y-%m-%d/%H:%M:%S").to_string())
                        .unwrap_or_else(|| " ".repeat(19));
                    print!("{}  ", local);
                }
                None => print!("{}", " ".repeat(21)),
            }
            // Pad to the longest tag name ("importlet").
            print!("{:<10}", dtype);
            if paper.is_stale(&item) {
                print!("{}", "*".red());
            } else {
                print!(" ");
            }
        }
        println!("{}", name);
    }
    paper.close()?;
    Ok(())
}

/// Expand a set of names by everything that depends on them.
fn dependent_closure(paper: &ActivePaper, names: &mut BTreeSet<String>) {
    let graph = paper.dependency_graph();
    loop {
        let mut grew = false;
        for name in names.clone() {
            if let Some(dependents) = graph.get(&name) {
                for dependent in dependents {
                    grew |= names.insert(dependent.clone());
                }
            }
        }
        if !grew {
            break;
        }
    }
}

fn rm(global: &GlobalOptions, opts: PatternOptions) -> anyhow::Result<()> {
    let paper_path = get_paper(global)?;
    let paper = ActivePaper::open(&paper_path, "r")?;
    let patterns = files::build_patterns(&opts.patterns)?;
    let mut names: BTreeSet<String> = paper
        .iter_items()
        .into_iter()
        .chain(paper.iter_groups())
        .filter(|item| files::matches(&patterns, item.trim_start_matches('/')))
        .collect();
    dependent_closure(&paper, &mut names);
    paper.close()?;
    if names.is_empty() {
        return Ok(());
    }
    if !opts.force {
        for name in &names {
            println!("{}", name);
        }
        if !confirm("Delete?")? {
            return Ok(());
        }
    }
    let paper = ActivePaper::open(&paper_path, "r+")?;
    let mut deleted_group: Option<String> = None;
    for name in &names {
        if let Some(group) = &deleted_group {
            if name.starts_with(&format!("{}/", group)) {
                continue;
            }
        }
        if paper.contains(name) {
            match paper.delete_item(name) {
                Ok(()) => {
                    deleted_group = Some(name.clone());
                }
                Err(e) => eprintln!("Can't delete {}: {}", name, e),
            }
        }
    }
    paper.close()?;
    Ok(())
}

fn dummy(global: &GlobalOptions, opts: PatternOptions) -> anyhow::Result<()> {
    let paper_path = get_paper(global)?;
    let paper = ActivePaper::open(&paper_path, "r")?;
    let patterns = files::build_patterns(&opts.patterns)?;
    let names: BTreeSet<String> = paper
        .iter_items()
        .into_iter()
        .filter(|item| files::matches(&patterns, item.trim_start_matches('/')))
        .collect();
    paper.close()?;
    if names.is_empty() {
        return Ok(());
    }
    if !opts.force {
        for name in &names {
            println!("{}", name);
        }
        if !confirm("Replace by dummy datasets?")? {
            return Ok(());
        }
    }
    let paper = ActivePaper::open(&paper_path, "r+")?;
    for name in &names {
        paper
            .replace_by_dummy(name)
            .with_context(|| format!("can't replace {} by dummy", name))?;
    }
    paper.close()?;
    Ok(())
}

fn set(global: &GlobalOptions, opts: SetOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    let engine = rhai::Engine::new();
    let value = engine
        .eval_expression::<rhai::Dynamic>(&opts.expr)
        .map_err(|e| anyhow!("cannot evaluate {}: {}", opts.expr, e))?;
    let value = Value::from_dynamic(&value).map_err(|m| anyhow!(m))?;
    let full = crate::paths::datapath(&opts.dataset)?;
    if paper.contains(&full) {
        paper.delete_item(&full)?;
    }
    paper.set_data(&opts.dataset, value)?;
    paper.close()?;
    Ok(())
}

fn group(global: &GlobalOptions, opts: GroupOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    paper.create_group(&opts.name)?;
    paper.close()?;
    Ok(())
}

fn extract(global: &GlobalOptions, opts: ExtractOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r")?;
    let item = if opts.dataset.starts_with('/') {
        opts.dataset.clone()
    } else {
        format!("/{}", opts.dataset)
    };
    let result = if opts.filename == "-" {
        files::extract_to_file(&paper, &item, ExtractTarget::Stdout)
    } else {
        files::extract_to_file(&paper, &item, ExtractTarget::File(Path::new(&opts.filename)))
    };
    paper.close()?;
    result?;
    Ok(())
}

fn script(global: &GlobalOptions, opts: ScriptOptions, importlet: bool) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    let source = std::fs::read_to_string(&opts.file)
        .with_context(|| format!("cannot read {}", opts.file.display()))?;
    let path = opts
        .path
        .strip_prefix("code/")
        .unwrap_or(opts.path.as_str());
    let codelet = if importlet {
        paper.create_importlet(path, &source)?
    } else {
        paper.create_calclet(path, &source)?
    };
    if opts.run {
        if let Some(traceback) = codelet.run()? {
            paper.close()?;
            bail!("{}", traceback);
        }
    }
    paper.close()?;
    Ok(())
}

fn import_module(global: &GlobalOptions, opts: ImportModuleOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    paper.import_module(&opts.name, &opts.search)?;
    paper.close()?;
    Ok(())
}

fn run(global: &GlobalOptions, opts: RunOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    if opts.checkin {
        checkin_directory(&paper, Path::new("code"), None, false, false)?;
    }
    let result = paper.run_codelet(&opts.codelet, opts.debug);
    match result {
        Ok(None) => {
            paper.close()?;
            Ok(())
        }
        Ok(Some(traceback)) => {
            paper.close()?;
            bail!("{}", traceback);
        }
        Err(e) => {
            paper.close()?;
            Err(e.into())
        }
    }
}

fn update(global: &GlobalOptions, opts: UpdateOptions) -> anyhow::Result<()> {
    let paper_path = get_paper(global)?;
    loop {
        let paper = ActivePaper::open(&paper_path, "r")?;
        let layers = paper.dependency_hierarchy()?;
        let mut found: Option<(String, String)> = None;
        'search: for layer in layers.iter().skip(1) {
            for item in layer {
                if paper.is_dummy(item) || paper.is_stale(item) {
                    if let Some(codelet) = paper.generating_codelet(item) {
                        found = Some((codelet, item.clone()));
                        break 'search;
                    }
                }
            }
        }
        paper.close()?;
        let Some((codelet, item)) = found else {
            return Ok(());
        };
        if opts.verbose {
            println!("Dataset {} is stale or dummy, running {}", item, codelet);
        }
        let paper = ActivePaper::open(&paper_path, "r+")?;
        if let Some(traceback) = paper.run_codelet(&codelet, false)? {
            paper.close()?;
            bail!("{}", traceback);
        }
        paper.close()?;
    }
}

fn checkin_directory(
    paper: &ActivePaper,
    directory: &Path,
    datatype: Option<&str>,
    force: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    if !directory.is_dir() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(directory)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        match files::update_from_file(paper, entry.path(), datatype, force, dry_run) {
            Ok(Some(message)) => println!("{}", message),
            Ok(None) => {}
            Err(e) => eprintln!("{}", e),
        }
    }
    Ok(())
}

fn checkin(global: &GlobalOptions, opts: CheckinOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    let cwd = std::env::current_dir()?;
    for file in &opts.files {
        let relative = if file.is_absolute() {
            file.strip_prefix(&cwd)
                .map_err(|_| anyhow!("{} is not in the working directory", file.display()))?
                .to_path_buf()
        } else {
            file.clone()
        };
        if relative.is_dir() {
            checkin_directory(
                &paper,
                &relative,
                opts.datatype.as_deref(),
                opts.force,
                opts.dry_run,
            )?;
        } else {
            match files::update_from_file(
                &paper,
                &relative,
                opts.datatype.as_deref(),
                opts.force,
                opts.dry_run,
            ) {
                Ok(Some(message)) => println!("{}", message),
                Ok(None) => {}
                Err(e) => eprintln!("{}", e),
            }
        }
    }
    paper.close()?;
    Ok(())
}

fn checkout(global: &GlobalOptions, opts: CheckoutOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r")?;
    let patterns = files::build_patterns(&opts.patterns)?;
    let cwd = std::env::current_dir()?;
    for item in paper.iter_items() {
        let name = item.trim_start_matches('/');
        if !files::matches(&patterns, name) {
            continue;
        }
        let dtype = paper.datatype_of(&item).unwrap_or_default();
        if let Some(wanted) = &opts.datatype {
            if dtype != *wanted {
                continue;
            }
        }
        if opts.dry_run {
            println!("Would extract {}", item);
            continue;
        }
        match files::extract_to_file(&paper, &item, ExtractTarget::Directory(&cwd)) {
            Ok(_) => {}
            Err(e) => eprintln!("Skipping {}: {}", item, e),
        }
    }
    paper.close()?;
    Ok(())
}

/// Parse `kind:scheme:label[:path]`.
fn parse_full_ref(reference: &str) -> anyhow::Result<(String, String, Option<String>)> {
    let parts: Vec<&str> = reference.splitn(4, ':').collect();
    if parts.len() < 3 {
        bail!("invalid reference {}", reference);
    }
    let kind = parts[0].to_string();
    if !["data", "code", "module", "file"].contains(&kind.as_str()) {
        bail!("invalid reference kind {}", kind);
    }
    let paper_ref = format!("{}:{}", parts[1], parts[2]);
    let path = parts
        .get(3)
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string());
    Ok((kind, paper_ref, path))
}

fn ln(global: &GlobalOptions, opts: LinkOptions) -> anyhow::Result<()> {
    let (kind, paper_ref, ref_path) = parse_full_ref(&opts.reference)?;
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    let result = match kind.as_str() {
        "data" => paper.create_data_ref(&opts.name, &paper_ref, ref_path.as_deref()),
        "code" => paper.create_code_ref(&opts.name, &paper_ref, ref_path.as_deref()),
        "module" => paper.create_module_ref(&opts.name, &paper_ref, ref_path.as_deref()),
        _ => paper.create_ref(&opts.name, &paper_ref, ref_path.as_deref()),
    };
    paper.close()?;
    result?;
    Ok(())
}

fn qualify_for_copy(kind: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    match kind {
        "data" if !name.starts_with("data/") => format!("data/{}", name),
        "code" | "module" if !name.starts_with("code/") => format!("code/{}", name),
        _ => name.to_string(),
    }
}

fn cp(global: &GlobalOptions, opts: LinkOptions) -> anyhow::Result<()> {
    let (kind, paper_ref, ref_path) = parse_full_ref(&opts.reference)?;
    let paper = ActivePaper::open(&get_paper(global)?, "r+")?;
    let name = qualify_for_copy(&kind, &opts.name);
    let ref_path = ref_path.map(|p| qualify_for_copy(&kind, &p));
    let result = paper.create_copy(&name, &paper_ref, ref_path.as_deref());
    paper.close()?;
    result?;
    Ok(())
}

fn refs(global: &GlobalOptions, opts: RefsOptions) -> anyhow::Result<()> {
    let paper = ActivePaper::open(&get_paper(global)?, "r")?;
    let references = paper.external_references();
    paper.close()?;
    for (paper_ref, (links, copies)) in &references {
        println!("{}", paper_ref);
        if opts.verbose {
            if !links.is_empty() {
                println!("  links:");
                for link in links {
                    println!("    {}", link);
                }
            }
            if !copies.is_empty() {
                println!("  copies:");
                for copy in copies {
                    println!("    {}", copy);
                }
            }
        }
    }
    Ok(())
}
