//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

const BIN_NAME: &str = "serialterm";
const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

/// `serialterm completions [SHELL] [--install]`.
pub(crate) fn cmd_completions(shell: Option<Shell>, install: bool) -> Result<()> {
    if install {
        return install_completions(shell);
    }
    let shell = shell.ok_or_else(|| {
        CliError::Usage(format!(
            "specify a shell, e.g. `{BIN_NAME} completions bash`, or use `{BIN_NAME} completions --install`"
        ))
    })?;
    write_script(shell, &mut io::stdout());
    Ok(())
}

fn write_script(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, out);
}

/// Guess the user's shell from `$SHELL` (or PowerShell on Windows).
pub(crate) fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    match Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
    {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn completion_file_name(shell: Shell) -> Option<String> {
    match shell {
        Shell::Bash => Some(BIN_NAME.to_string()),
        Shell::Zsh => Some(format!("_{BIN_NAME}")),
        Shell::Fish => Some(format!("{BIN_NAME}.fish")),
        Shell::PowerShell => Some(format!("{BIN_NAME}.ps1")),
        Shell::Elvish => Some(format!("{BIN_NAME}.elv")),
        _ => None,
    }
}

fn completion_dir(shell: Shell) -> Result<PathBuf> {
    Ok(match shell {
        Shell::Bash => data_dir().join("bash-completion").join("completions"),
        Shell::Zsh => home_dir()?.join(".zfunc"),
        Shell::Fish => config_dir().join("fish").join("completions"),
        Shell::Elvish => config_dir().join("elvish").join("lib"),
        Shell::PowerShell => match env::var("PROFILE") {
            Ok(profile) => PathBuf::from(profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
            Err(_) => home_dir()?
                .join(".config")
                .join("powershell")
                .join("completions"),
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    })
}

fn install_path(shell: Shell) -> Result<PathBuf> {
    let name = completion_file_name(shell).context("Unsupported shell for auto-install")?;
    Ok(completion_dir(shell)?.join(name))
}

fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

fn config_dir() -> PathBuf {
    env::var("XDG_CONFIG_HOME").map_or_else(
        |_| home_dir().unwrap_or_default().join(".config"),
        PathBuf::from,
    )
}

fn data_dir() -> PathBuf {
    env::var("XDG_DATA_HOME").map_or_else(
        |_| home_dir().unwrap_or_default().join(".local").join("share"),
        PathBuf::from,
    )
}

fn install_completions(shell: Option<Shell>) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => detect_shell_type().ok_or_else(|| {
            CliError::Usage(format!(
                "could not detect your shell; name it explicitly: {BIN_NAME} completions --install bash"
            ))
        })?,
    };

    let path = install_path(shell)?;
    let mut script = Vec::new();
    write_script(shell, &mut script);

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

    match shell {
        Shell::Bash => eprintln!(
            "\nTo activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => {
            ensure_zsh_fpath()?;
            eprintln!("\nRestart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => eprintln!(
            "\nAdd this to your PowerShell profile: {}",
            style(format!("Import-Module {}", path.display())).cyan()
        ),
        _ => eprintln!("\nCompletions load automatically in new sessions."),
    }
    Ok(())
}

/// Make sure `~/.zshrc` puts `~/.zfunc` on `fpath`.
fn ensure_zsh_fpath() -> Result<()> {
    let zshrc = home_dir()?.join(".zshrc");
    let present = fs::read_to_string(&zshrc).is_ok_and(|c| c.contains(ZSH_FPATH_LINE));
    if present {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN_NAME} completions")?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
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
    fn test_completion_file_names() {
        assert_eq!(completion_file_name(Shell::Bash).as_deref(), Some("serialterm"));
        assert_eq!(completion_file_name(Shell::Zsh).as_deref(), Some("_serialterm"));
        assert_eq!(
            completion_file_name(Shell::Fish).as_deref(),
            Some("serialterm.fish")
        );
        assert_eq!(
            completion_file_name(Shell::Elvish).as_deref(),
            Some("serialterm.elv")
        );
    }

    #[test]
    fn test_install_path_bash_and_fish() {
        let bash = install_path(Shell::Bash).unwrap();
        assert!(bash.to_string_lossy().contains("bash-completion"));
        let fish = install_path(Shell::Fish).unwrap();
        assert!(fish.to_string_lossy().ends_with("serialterm.fish"));
    }

    #[test]
    fn test_install_path_zsh_uses_zfunc() {
        if env::var("HOME").is_ok() {
            let path = install_path(Shell::Zsh).unwrap();
            assert!(path.to_string_lossy().contains(".zfunc"));
        }
    }

    #[test]
    fn test_scripts_name_the_binary() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            let mut buf = Vec::new();
            write_script(shell, &mut buf);
            assert!(String::from_utf8(buf).unwrap().contains("serialterm"));
        }
    }

    #[test]
    fn test_missing_shell_is_usage_error() {
        let err = cmd_completions(None, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }
}
