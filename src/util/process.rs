//! Helpers around external commands.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output};

use derive_more::{Display, Error};

/// A required external tool isn't installed.
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("Required command not found in PATH: {}", _0.join(", "))]
pub struct MissingDependency(#[error(ignore)] pub Vec<String>);

#[derive(Debug, Display, Error)]
/// An external command couldn't be run or failed.
pub enum CommandError {
    /// The command couldn't be spawned or waited for.
    #[display("Running `{command}` failed: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The command exited unsuccessfully.
    #[display("`{command}` exited with {status}{}", detail(stderr))]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

fn detail(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl CommandError {
    pub fn spawn(command: &Command) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Spawn {
            command: render(command),
            source,
        }
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Looks up `program` like a shell would.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    find_executable_in(program, &env::var_os("PATH").unwrap_or_default())
}

/// Looks up `program` in the directories of `search_path`, formatted like `PATH`.
pub fn find_executable_in(program: &str, search_path: &OsStr) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Fails if any of `programs` can't be found in `PATH`.
pub fn require_tools<'a>(
    programs: impl IntoIterator<Item = &'a str>,
) -> Result<(), MissingDependency> {
    require_tools_in(&env::var_os("PATH").unwrap_or_default(), programs)
}

/// Fails if any of `programs` can't be found in `search_path`.
pub fn require_tools_in<'a>(
    search_path: &OsStr,
    programs: impl IntoIterator<Item = &'a str>,
) -> Result<(), MissingDependency> {
    let mut missing: Vec<String> = Vec::new();
    for program in programs {
        if find_executable_in(program, search_path).is_none()
            && !missing.iter().any(|m| m == program)
        {
            missing.push(program.to_string());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MissingDependency(missing))
    }
}

fn mask(arg: &str) -> String {
    match arg.split_once('=') {
        Some((flag, _)) if flag == "--password" || flag == "-p" => format!("{flag}=***"),
        _ if arg.starts_with("-p") && arg.len() > 2 && !arg.starts_with("--") => "-p***".into(),
        _ => arg.to_string(),
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,*".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Renders `command` as a shell-like line, masking passwords.
///
/// Environment variables set on the command are never rendered.
pub fn render(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|arg| quote(&mask(&arg.to_string_lossy())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prints the command a dry run skips.
pub fn print_dry_run(command: &Command) {
    println!("[dry-run] {}", render(command));
}

/// Turns an unsuccessful `status` into a [CommandError].
pub fn check_status(
    command: &Command,
    status: ExitStatus,
    stderr: &[u8],
) -> Result<(), CommandError> {
    if status.success() {
        return Ok(());
    }

    Err(CommandError::Failed {
        command: render(command),
        status,
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    })
}

/// Runs `command` to completion and returns its captured output.
///
/// Stderr of successful commands is relayed as warning.
pub fn output(command: &mut Command, target: &str) -> Result<Output, CommandError> {
    log::trace!(target: target, "Running: {}", render(command));
    let output = command.output().map_err(CommandError::spawn(command))?;
    check_status(command, output.status, &output.stderr)?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        log::warn!(target: target, "{}", stderr.trim_end());
    }

    Ok(output)
}
