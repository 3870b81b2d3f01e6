use crate::error::{Error, Result};
use libc::pid_t;
use nix::unistd::{getuid, Uid, User};
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Run `path` with `args`, capture everything it writes to standard
/// output and return it. When `input` is given it is fed to the child's
/// standard input first.
///
/// The external tools the toolkit drives (`objdump`, `hexdump`) live at
/// well-known absolute paths and are trusted; a tool that cannot be
/// spawned surfaces as `ToolFailure`.
pub fn get_command_output(path: &str, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    if input.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::ToolFailure(format!("{}: {}", path, e)))?;

    if let Some(bytes) = input {
        // The child may exit without draining stdin; a broken pipe here
        // is not interesting.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(bytes);
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| Error::ToolFailure(format!("{}: {}", path, e)))?;

    Ok(output.stdout)
}

/// Find a process by the basename of its executable and the user it runs
/// under.
///
/// `user` may be `"-"` to match any user. Any other name scopes the scan
/// to that user's uid; a name that does not resolve (including the empty
/// string) falls back to the current uid.
pub fn find_process(user: &str, name: &str) -> Result<pid_t> {
    let uid: Option<Uid> = if user == "-" {
        None
    } else {
        match User::from_name(user) {
            Ok(Some(u)) => Some(u.uid),
            _ => Some(getuid()),
        }
    };

    for entry in fs::read_dir("/proc").map_err(Error::RemoteIo)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let fname = entry.file_name();
        let pid: pid_t = match fname.to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        if let Some(uid) = uid {
            let meta = match fs::metadata(format!("/proc/{}", pid)) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.uid() != uid.as_raw() {
                continue;
            }
        }

        // Resolve the executable behind the pid; kernel threads and
        // vanished processes simply don't resolve.
        let exe = match fs::canonicalize(format!("/proc/{}/exe", pid)) {
            Ok(p) => p,
            Err(_) => continue,
        };

        if exe.file_name().map(|f| f == name).unwrap_or(false) {
            return Ok(pid);
        }
    }

    Err(Error::NotFound(format!("process {}/{}", user, name)))
}

/// Resolve a process specifier of the form `( [<user>/]exec_name | pid )`.
///
/// An all-digit specifier is a pid and is only checked for existence.
/// `<user>` may be `-` to match all users; with no user component the
/// scan covers all users when the caller is root and only the caller's
/// own processes otherwise.
pub fn resolve_process(specifier: &str) -> Result<pid_t> {
    if let Ok(pid) = specifier.parse::<pid_t>() {
        return if Path::new(&format!("/proc/{}", pid)).exists() {
            Ok(pid)
        } else {
            Err(Error::NotFound(format!("process {}", pid)))
        };
    }

    match specifier.find('/') {
        Some(sep) => find_process(&specifier[..sep], &specifier[sep + 1..]),
        None => {
            let user = if getuid().is_root() { "-" } else { "" };
            find_process(user, specifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_is_captured() {
        let out = get_command_output("/bin/echo", &["hello"], None).unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn command_input_is_fed() {
        let out = get_command_output("/bin/cat", &[], Some(b"roundtrip")).unwrap();
        assert_eq!(out, b"roundtrip");
    }

    #[test]
    fn missing_tool_is_a_tool_failure() {
        match get_command_output("/nonexistent/tool", &[], None) {
            Err(Error::ToolFailure(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn numeric_specifier_resolves_to_itself() {
        let me = std::process::id() as pid_t;
        assert_eq!(resolve_process(&me.to_string()).unwrap(), me);
    }

    #[test]
    fn dead_pid_is_not_found() {
        // Pids wrap far below this on default kernels.
        assert!(resolve_process("4194304000").is_err());
    }
}
