use std::{path::Path, process::ExitCode};

use {anyhow::Result, clap::Subcommand};

use clawport_config::{
    ClawportConfig, Severity, ValidationResult, find_config_file, find_or_default_config_path,
    load_config, save_config, validate,
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration with secrets redacted.
    Show,
    /// Print the config file path in use (or the one that would be created).
    Path,
    /// Write a default config file unless one already exists.
    Init,
}

pub fn handle_config(action: ConfigAction) -> Result<ExitCode> {
    match action {
        ConfigAction::Check { verbose } => Ok(check(find_config_file().as_deref(), verbose)),
        ConfigAction::Show => {
            let config = match find_config_file() {
                Some(path) => load_config(&path)?,
                None => ClawportConfig::default(),
            };
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(ExitCode::SUCCESS)
        },
        ConfigAction::Path => {
            println!("{}", find_or_default_config_path().display());
            Ok(ExitCode::SUCCESS)
        },
        ConfigAction::Init => {
            if let Some(existing) = find_config_file() {
                eprintln!("Config already exists at {}", existing.display());
                return Ok(ExitCode::FAILURE);
            }
            let path = save_config(&ClawportConfig::default())?;
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(path: Option<&Path>, verbose: bool) -> ExitCode {
    let config = match path {
        Some(path) => {
            eprintln!("Checking {}\n", path.display());
            match load_config(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("  {BOLD}{RED}error{RESET} {e}");
                    return ExitCode::FAILURE;
                },
            }
        },
        None => {
            eprintln!("No config file found; checking defaults.\n");
            ClawportConfig::default()
        },
    };

    let result = validate(&config);
    let lines = render(&result, verbose);
    for line in &lines {
        eprintln!("  {line}");
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if !lines.is_empty() {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn render(result: &ValidationResult, verbose: bool) -> Vec<String> {
    result
        .diagnostics
        .iter()
        .filter(|d| verbose || d.severity != Severity::Info)
        .map(|d| {
            let color = match d.severity {
                Severity::Error => RED,
                Severity::Warning => YELLOW,
                Severity::Info => CYAN,
            };
            format!(
                "{BOLD}{color}{}{RESET} {}: {}",
                d.severity, d.path, d.message
            )
        })
        .collect()
}
