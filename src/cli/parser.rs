//! Hand-rolled argument parser for the `aptool` CLI.

use std::path::PathBuf;

use super::command::*;

/// Known subcommand names.
pub const SUBCOMMANDS: &[&str] = &[
    "create",
    "ls",
    "rm",
    "dummy",
    "set",
    "group",
    "extract",
    "calclet",
    "importlet",
    "import_module",
    "run",
    "update",
    "checkin",
    "checkout",
    "ln",
    "cp",
    "refs",
];

pub fn is_subcommand(arg: &str) -> bool {
    SUBCOMMANDS.contains(&arg)
}

/// Closest known subcommand for a typo, if any is close enough.
pub fn suggest(unknown: &str) -> Option<&'static str> {
    SUBCOMMANDS
        .iter()
        .map(|c| (*c, strsim::jaro_winkler(unknown, c)))
        .filter(|(_, score)| *score > 0.8)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
}

fn missing(what: &str, command: &str) -> String {
    format!("{} requires {}", command, what)
}

fn take_value(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} expects a value", flag))
}

/// Parse the full argument list (without the program name).
pub fn parse(args: &[String]) -> Result<(GlobalOptions, Command), String> {
    let mut global = GlobalOptions::default();
    let mut i = 0;

    // Global flags may precede the subcommand.
    while i < args.len() {
        match args[i].as_str() {
            "-p" | "--paper" => {
                global.paper = Some(PathBuf::from(take_value(args, &mut i, "--paper")?));
                i += 1;
            }
            "--help" | "-h" => return Ok((global, Command::Help)),
            "--version" | "-V" => return Ok((global, Command::Version)),
            _ => break,
        }
    }

    let name = match args.get(i) {
        Some(n) => n.clone(),
        None => return Ok((global, Command::Help)),
    };
    i += 1;
    let rest = &args[i..];

    let command = match name.as_str() {
        "create" => {
            let mut opts = CreateOptions::default();
            let mut j = 0;
            while j < rest.len() {
                match rest[j].as_str() {
                    "-d" | "--dependency" => {
                        opts.packages.push(take_value(rest, &mut j, "-d")?);
                    }
                    other => return Err(format!("create: unexpected argument {}", other)),
                }
                j += 1;
            }
            Command::Create(opts)
        }
        "ls" => {
            let mut opts = LsOptions::default();
            let mut j = 0;
            while j < rest.len() {
                match rest[j].as_str() {
                    "-l" | "--long" => opts.long = true,
                    "-t" | "--type" => {
                        opts.datatype = Some(take_value(rest, &mut j, "--type")?);
                    }
                    other if other.starts_with('-') => {
                        return Err(format!("ls: unknown flag {}", other))
                    }
                    other => opts.patterns.push(other.to_string()),
                }
                j += 1;
            }
            Command::Ls(opts)
        }
        "rm" | "dummy" => {
            let mut opts = PatternOptions::default();
            let mut j = 0;
            while j < rest.len() {
                match rest[j].as_str() {
                    "-f" | "--force" => opts.force = true,
                    other if other.starts_with('-') => {
                        return Err(format!("{}: unknown flag {}", name, other))
                    }
                    other => opts.patterns.push(other.to_string()),
                }
                j += 1;
            }
            if opts.patterns.is_empty() {
                return Err(missing("at least one pattern", &name));
            }
            if name == "rm" {
                Command::Rm(opts)
            } else {
                Command::Dummy(opts)
            }
        }
        "set" => {
            let dataset = rest.first().ok_or_else(|| missing("a dataset name", "set"))?;
            let expr = rest.get(1).ok_or_else(|| missing("an expression", "set"))?;
            Command::Set(SetOptions {
                dataset: dataset.clone(),
                expr: expr.clone(),
            })
        }
        "group" => {
            let group = rest.first().ok_or_else(|| missing("a group name", "group"))?;
            Command::Group(GroupOptions {
                name: group.clone(),
            })
        }
        "extract" => {
            let dataset = rest
                .first()
                .ok_or_else(|| missing("a dataset name", "extract"))?;
            let filename = rest
                .get(1)
                .ok_or_else(|| missing("an output file (or -)", "extract"))?;
            Command::Extract(ExtractOptions {
                dataset: dataset.clone(),
                filename: filename.clone(),
            })
        }
        "calclet" | "importlet" => {
            let mut run = false;
            let mut positional = Vec::new();
            for arg in rest {
                match arg.as_str() {
                    "-r" | "--run" => run = true,
                    other if other.starts_with('-') => {
                        return Err(format!("{}: unknown flag {}", name, other))
                    }
                    other => positional.push(other.to_string()),
                }
            }
            if positional.len() != 2 {
                return Err(missing("an item path and a script file", &name));
            }
            let opts = ScriptOptions {
                path: positional[0].clone(),
                file: PathBuf::from(&positional[1]),
                run,
            };
            if name == "calclet" {
                Command::Calclet(opts)
            } else {
                Command::Importlet(opts)
            }
        }
        "import_module" => {
            let module = rest
                .first()
                .ok_or_else(|| missing("a module name", "import_module"))?;
            let search: Vec<PathBuf> = rest[1..].iter().map(PathBuf::from).collect();
            Command::ImportModule(ImportModuleOptions {
                name: module.clone(),
                search: if search.is_empty() {
                    vec![PathBuf::from(".")]
                } else {
                    search
                },
            })
        }
        "run" => {
            let mut opts = RunOptions {
                codelet: String::new(),
                debug: false,
                checkin: false,
            };
            for arg in rest {
                match arg.as_str() {
                    "--debug" => opts.debug = true,
                    "--checkin" => opts.checkin = true,
                    other if other.starts_with('-') => {
                        return Err(format!("run: unknown flag {}", other))
                    }
                    other if opts.codelet.is_empty() => opts.codelet = other.to_string(),
                    other => return Err(format!("run: unexpected argument {}", other)),
                }
            }
            if opts.codelet.is_empty() {
                return Err(missing("a codelet path", "run"));
            }
            Command::Run(opts)
        }
        "update" => {
            let mut opts = UpdateOptions::default();
            for arg in rest {
                match arg.as_str() {
                    "-v" | "--verbose" => opts.verbose = true,
                    other => return Err(format!("update: unexpected argument {}", other)),
                }
            }
            Command::Update(opts)
        }
        "checkin" => {
            let mut opts = CheckinOptions::default();
            let mut j = 0;
            while j < rest.len() {
                match rest[j].as_str() {
                    "-t" | "--type" => {
                        opts.datatype = Some(take_value(rest, &mut j, "--type")?);
                    }
                    "-f" | "--force" => opts.force = true,
                    "--dry-run" => opts.dry_run = true,
                    other if other.starts_with('-') => {
                        return Err(format!("checkin: unknown flag {}", other))
                    }
                    other => opts.files.push(PathBuf::from(other)),
                }
                j += 1;
            }
            if opts.files.is_empty() {
                return Err(missing("at least one file", "checkin"));
            }
            Command::Checkin(opts)
        }
        "checkout" => {
            let mut opts = CheckoutOptions::default();
            let mut j = 0;
            while j < rest.len() {
                match rest[j].as_str() {
                    "-t" | "--type" => {
                        opts.datatype = Some(take_value(rest, &mut j, "--type")?);
                    }
                    "--dry-run" => opts.dry_run = true,
                    other if other.starts_with('-') => {
                        return Err(format!("checkout: unknown flag {}", other))
                    }
                    other => opts.patterns.push(other.to_string()),
                }
                j += 1;
            }
            Command::Checkout(opts)
        }
        "ln" | "cp" => {
            let reference = rest
                .first()
                .ok_or_else(|| missing("a reference (kind:scheme:label[:path])", &name))?;
            let local = rest.get(1).ok_or_else(|| missing("a local name", &name))?;
            let opts = LinkOptions {
                reference: reference.clone(),
                name: local.clone(),
            };
            if name == "ln" {
                Command::Ln(opts)
            } else {
                Command::Cp(opts)
            }
        }
        "refs" => {
            let mut opts = RefsOptions::default();
            for arg in rest {
                match arg.as_str() {
                    "-v" | "--verbose" => opts.verbose = true,
                    other => return Err(format!("refs: unexpected argument {}", other)),
                }
            }
            Command::Refs(opts)
        }
        unknown => {
            let mut message = format!("unknown command: {}", unknown);
            if let Some(suggestion) = suggest(unknown) {
                message.push_str(&format!(" (did you mean {}?)", suggestion));
            }
            return Err(message);
        }
    };
    Ok((global, command))
}
