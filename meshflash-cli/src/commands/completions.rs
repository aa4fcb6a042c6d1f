//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

/// Binary name completions are registered for.
const BIN: &str = "meshflash";

/// Line that puts `~/.zfunc` on zsh's function path.
const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    if cfg!(windows) && env::var_os("PSModulePath").is_some() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` is installed.
fn install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => data_dir()?
            .join("bash-completion")
            .join("completions")
            .join(BIN),
        Shell::Zsh => home_dir()?.join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => config_dir()?
            .join("fish")
            .join("completions")
            .join(format!("{BIN}.fish")),
        Shell::Elvish => config_dir()?
            .join("elvish")
            .join("lib")
            .join(format!("{BIN}.elv")),
        Shell::PowerShell => {
            let dir = match env::var_os("PROFILE") {
                Some(profile) => PathBuf::from(profile)
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
                None => home_dir()?
                    .join(".config")
                    .join("powershell")
                    .join("completions"),
            };
            dir.join(format!("{BIN}.ps1"))
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

/// `$XDG_CONFIG_HOME`, or `~/.config`.
fn config_dir() -> Result<PathBuf> {
    match env::var_os("XDG_CONFIG_HOME") {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(home_dir()?.join(".config")),
    }
}

/// `$XDG_DATA_HOME`, or `~/.local/share`.
fn data_dir() -> Result<PathBuf> {
    match env::var_os("XDG_DATA_HOME") {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(home_dir()?.join(".local").join("share")),
    }
}

/// Make sure `~/.zshrc` loads functions from `~/.zfunc`.
fn ensure_zsh_fpath() -> Result<()> {
    let zshrc = home_dir()?.join(".zshrc");
    let present = fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(ZSH_FPATH_LINE));
    if present {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN} completions")?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg.or_else(detect_shell_type) {
        Some(shell) => shell,
        None => {
            return Err(CliError::Usage(format!(
                "Could not detect your shell. Please specify it explicitly:\n  {BIN} completions --install bash"
            ))
            .into());
        },
    };
    let path = install_path(shell)?;

    let mut script = Vec::new();
    generate(shell, &mut Cli::command(), BIN, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );
    eprintln!();

    match shell {
        Shell::Bash => {
            eprintln!("Completions will be loaded automatically on new terminals.");
            eprintln!(
                "To activate now: {}",
                style(format!("source {}", path.display())).cyan()
            );
        },
        Shell::Zsh => {
            ensure_zsh_fpath()?;
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => {
            eprintln!("Add this to your PowerShell profile to load on startup:");
            eprintln!(
                "  {}",
                style(format!("Import-Module {}", path.display())).cyan()
            );
        },
        _ => eprintln!("Completions will be loaded automatically in new {shell:?} sessions."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("bash"), Some(Shell::Bash));
    }

    #[test]
    fn test_shell_from_path_unknown() {
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths_name_the_binary() {
        if home_dir().is_err() {
            return;
        }
        let bash = install_path(Shell::Bash).unwrap();
        assert!(bash.to_string_lossy().contains("bash-completion"));
        assert!(bash.ends_with(BIN));

        assert!(install_path(Shell::Zsh).unwrap().ends_with("_meshflash"));
        assert!(install_path(Shell::Fish).unwrap().ends_with("meshflash.fish"));
        assert!(install_path(Shell::Elvish).unwrap().ends_with("meshflash.elv"));
        assert!(install_path(Shell::PowerShell).unwrap().ends_with("meshflash.ps1"));
    }

    #[test]
    fn test_generated_script_mentions_subcommands() {
        let mut script = Vec::new();
        generate(Shell::Bash, &mut Cli::command(), BIN, &mut script);
        let script = String::from_utf8(script).unwrap();
        assert!(script.contains("_meshflash()"));
        assert!(script.contains("list-ports"));
    }
}
