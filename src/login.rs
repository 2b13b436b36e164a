//! Interactive login sessions
//!
//! Logging in requires a human at a terminal, so the backend executable is
//! started with its login flag inside a new, visible terminal window. The
//! launched process is disowned: the supervisor keeps no handle to it and it
//! outlives the supervisor.

use crate::registry::Backend;
use std::io::{Error, ErrorKind};
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};
use tokio::process::Command;
use tracing::info;

/// Builds and spawns login sessions
#[derive(Debug, Clone, Default)]
pub struct LoginLauncher {
    /// Terminal command prefix; the platform default is used when unset
    terminal: Option<Vec<String>>,
}

impl LoginLauncher {
    /// Create a launcher, parsing an optional terminal prefix such as
    /// `"x-terminal-emulator -e"` with shell quoting rules
    pub fn new(terminal: Option<&str>) -> anyhow::Result<Self> {
        let terminal = match terminal {
            Some(raw) => {
                let words = shell_words::split(raw)
                    .map_err(|e| anyhow::anyhow!("Invalid login_terminal '{}': {}", raw, e))?;
                if words.is_empty() {
                    anyhow::bail!("login_terminal must not be empty");
                }
                Some(words)
            }
            None => None,
        };

        Ok(Self { terminal })
    }

    /// Build the command that opens a terminal running the login flow
    pub fn command_for(&self, backend: &Backend) -> Command {
        let mut inner = Vec::with_capacity(backend.login_args.len() + 1);
        inner.push(backend.program().to_string_lossy().into_owned());
        inner.extend(backend.login_args.iter().cloned());

        let mut cmd = match &self.terminal {
            Some(prefix) => {
                let mut cmd = StdCommand::new(&prefix[0]);
                cmd.args(&prefix[1..]).args(&inner);
                cmd
            }
            None => platform_terminal(backend, &inner),
        };

        cmd.current_dir(&backend.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        // Keep the session out of our process group so our signals never reach it
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        Command::from(cmd)
    }

    /// Open the login terminal for `backend` and disown it
    ///
    /// A missing backend executable is reported here. Inside the terminal the
    /// failure would only flash by before the window closes.
    pub fn launch(&self, backend: &Backend) -> std::io::Result<()> {
        let program = backend.program();
        if !program_available(&program) {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("backend executable '{}' not found", program.display()),
            ));
        }

        let mut cmd = self.command_for(backend);
        let child = cmd.spawn()?;
        info!(
            id = %backend.id,
            pid = child.id().unwrap_or(0),
            program = ?cmd.as_std().get_program(),
            "Interactive login launched"
        );
        // Dropping the handle leaves the process running; tokio reaps it
        drop(child);
        Ok(())
    }
}

/// Whether `program` names an existing file, searching `PATH` for bare names
fn program_available(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

#[cfg(windows)]
fn platform_terminal(_backend: &Backend, inner: &[String]) -> StdCommand {
    let mut cmd = StdCommand::new("cmd");
    cmd.args(["/c", "start", "cmd", "/k"]).args(inner);
    cmd
}

#[cfg(target_os = "macos")]
fn platform_terminal(backend: &Backend, inner: &[String]) -> StdCommand {
    let dir = backend.working_dir.to_string_lossy();
    let script = format!(
        "cd {} && {}",
        shell_words::quote(&dir),
        shell_words::join(inner)
    );
    let escaped = script.replace('\\', "\\\\").replace('"', "\\\"");
    let mut cmd = StdCommand::new("osascript");
    cmd.arg("-e")
        .arg(format!("tell application \"Terminal\" to do script \"{}\"", escaped));
    cmd
}

#[cfg(all(unix, not(target_os = "macos")))]
fn platform_terminal(_backend: &Backend, inner: &[String]) -> StdCommand {
    let mut cmd = StdCommand::new("x-terminal-emulator");
    cmd.arg("-e").args(inner);
    cmd
}

#[cfg(not(any(unix, windows)))]
fn platform_terminal(_backend: &Backend, inner: &[String]) -> StdCommand {
    let mut cmd = StdCommand::new(&inner[0]);
    cmd.args(&inner[1..]);
    cmd
}
