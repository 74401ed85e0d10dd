use std::process::ExitCode;

use colored::Colorize;

use activepapers::cli::{self, Command};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = match cli::parse(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message.red());
            eprintln!("{}", cli::USAGE);
            return ExitCode::from(2);
        }
    };

    match command {
        Command::Help => {
            print!("{}", cli::USAGE);
            ExitCode::SUCCESS
        }
        Command::Version => {
            println!("aptool {}", activepapers::VERSION);
            ExitCode::SUCCESS
        }
        command => match cli::dispatch(&global, command) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("{}", format!("{:#}", error).red());
                ExitCode::FAILURE
            }
        },
    }
}
