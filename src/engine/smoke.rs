//! Post-install smoke test

use crate::core::error::InstallError;
use crate::formula::VerifyCommand;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long a verification command may run before it is killed
pub const SMOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Work out which executable a verification command refers to.
///
/// A bare name matching an installed file resolves to that file, otherwise
/// to `PREFIX/bin/<name>`. Relative paths are taken from the prefix and
/// absolute paths are used unchanged.
pub fn resolve_program(cmd: &VerifyCommand, installed: &[PathBuf], prefix: &Path) -> PathBuf {
    let program = Path::new(&cmd.program);
    if program.is_absolute() {
        return program.to_path_buf();
    }
    if program.components().count() == 1 {
        if let Some(found) = installed
            .iter()
            .find(|p| p.file_name() == Some(program.as_os_str()))
        {
            return found.clone();
        }
        return prefix.join("bin").join(program);
    }
    prefix.join(program)
}

/// Run the verification command. Returns the first line of its output.
pub fn run(cmd: &VerifyCommand, program: &Path) -> Result<String, InstallError> {
    run_with_timeout(cmd, program, SMOKE_TIMEOUT)
}

/// Like [`run`], killing the command if it is still running after `timeout`.
pub fn run_with_timeout(
    cmd: &VerifyCommand,
    program: &Path,
    timeout: Duration,
) -> Result<String, InstallError> {
    let fail = |reason: String| InstallError::Verification {
        command: cmd.to_string(),
        reason,
    };

    let child = spawn(program, &cmd.args)
        .map_err(|e| fail(format!("cannot launch {}: {}", program.display(), e)))?;
    let output = wait_with_timeout(child, timeout)
        .map_err(|e| fail(format!("waiting for {}: {}", program.display(), e)))?
        .ok_or_else(|| fail(format!("timed out after {:?}", timeout)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = stderr.trim();
        return Err(fail(if tail.is_empty() {
            format!("exit code {}", code)
        } else {
            format!("exit code {}\nstderr: {}", code, tail)
        }));
    }

    if let Some(expected) = &cmd.expect_output
        && !stdout.contains(expected.as_str())
        && !stderr.contains(expected.as_str())
    {
        return Err(fail(format!("output does not contain '{}'", expected)));
    }

    let first_line = stdout
        .lines()
        .chain(stderr.lines())
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();
    Ok(first_line)
}

/// A file that was just written can briefly report "text file busy" while
/// another thread's forked child still holds the write descriptor.
fn spawn(program: &Path, args: &[String]) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match spawned {
            Err(e) if e.kind() == ErrorKind::ExecutableFileBusy && attempts < 5 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(20 * attempts));
            }
            result => return result,
        }
    }
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// `Ok(None)` means the child was killed for running past `timeout`.
fn wait_with_timeout(mut child: Child, timeout: Duration) -> std::io::Result<Option<Captured>> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            // Readers are left detached: a grandchild may still hold the pipes
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    Ok(Some(Captured {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    }))
}
