//! Listening socket handoff across process re-creation.
//!
//! The parent launches a fresh copy of its own executable with the listener
//! duplicated onto fd 3 (the first slot after stdin/stdout/stderr) and
//! `RELOADING` set in the child's environment. The child adopts fd 3 and
//! sends SIGTERM to its parent to acknowledge the handoff.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::Stdio;

use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::{ReloadError, Result};

/// Environment variable whose presence marks a resumed child.
pub const ENV_MARKER: &str = "RELOADING";

/// Descriptor slot the listener occupies in the child.
pub const INHERITED_FD: RawFd = 3;

/// Whether this process was launched by a reloading parent.
pub(crate) fn is_resume() -> bool {
    std::env::var_os(ENV_MARKER).is_some()
}

/// Reconstruct the listener passed by the parent.
///
/// Aborts the process if fd 3 is missing, is not a listening socket, or
/// cannot be registered with the runtime: there is no other way for a
/// resumed child to obtain its socket.
pub(crate) fn adopt_inherited() -> TcpListener {
    if !validate_fd(INHERITED_FD) {
        fatal(&format!(
            "{ENV_MARKER} is set but fd {INHERITED_FD} is not an inherited listening socket"
        ));
    }

    // SAFETY: validated above as an open listening socket that nothing else
    // in this process owns.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(INHERITED_FD) };

    // Keep the descriptor from leaking into unrelated children; the next
    // handoff duplicates it explicitly.
    if let Err(e) = set_cloexec(INHERITED_FD, true) {
        fatal(&format!("failed to set FD_CLOEXEC on inherited fd: {e}"));
    }
    if let Err(e) = std_listener.set_nonblocking(true) {
        fatal(&format!("failed to set inherited listener non-blocking: {e}"));
    }

    match TcpListener::from_std(std_listener) {
        Ok(listener) => {
            info!(
                fd = INHERITED_FD,
                addr = ?listener.local_addr().ok(),
                "Inherited listener from parent process"
            );
            listener
        }
        Err(e) => fatal(&format!("failed to adopt inherited listener: {e}")),
    }
}

/// Tell the parent that the socket has been taken over.
pub(crate) fn acknowledge_parent() {
    // SAFETY: plain syscalls without pointer arguments.
    let parent = unsafe { libc::getppid() };
    if unsafe { libc::kill(parent, libc::SIGTERM) } == 0 {
        info!(parent, "Sent SIGTERM to parent process, handoff complete");
    } else {
        warn!(
            parent,
            error = %io::Error::last_os_error(),
            "Failed to signal parent process"
        );
    }
}

/// Launch a replacement process that inherits `listener` on fd 3.
///
/// Returns the child's pid once it has been started; does not wait for it
/// to bind. On failure the caller still owns a working listener.
pub(crate) fn spawn_replacement(listener: &TcpListener) -> Result<u32> {
    let exe = std::env::current_exe().map_err(ReloadError::CurrentExe)?;
    let fd = listener.as_raw_fd();

    let mut command = Command::new(&exe);
    command
        .args(std::env::args_os().skip(1))
        .env(ENV_MARKER, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: the hook only issues dup2/fcntl, which are async-signal-safe.
    unsafe {
        command.pre_exec(move || place_inherited_fd(fd));
    }

    let pid = launch(command)?;
    info!(pid, exe = %exe.display(), fd, "Launched replacement process");
    Ok(pid)
}

/// Spawn `command` and reap it in the background.
///
/// A replacement that dies early is logged instead of lingering as a zombie.
fn launch(mut command: Command) -> Result<u32> {
    let mut child = command.spawn().map_err(ReloadError::Spawn)?;
    let pid = child.id().unwrap_or_default();

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                info!(pid, "Replacement process exited");
            }
            Ok(status) => {
                warn!(pid, %status, "Replacement process exited with failure");
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for replacement process");
            }
        }
    });

    Ok(pid)
}

/// Runs in the forked child: move `fd` onto slot 3 and make it survive exec.
fn place_inherited_fd(fd: RawFd) -> io::Result<()> {
    if fd != INHERITED_FD && unsafe { libc::dup2(fd, INHERITED_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    set_cloexec(INHERITED_FD, false)
}

fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Check that `fd` is an open socket in the listening state.
fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return false;
    }

    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut accepting as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    result == 0 && accepting != 0
}

fn fatal(reason: &str) -> ! {
    error!(reason, "Cannot resume inherited listener, aborting");
    eprintln!("waddle-reloader: {reason}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloexec_set(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags >= 0);
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn test_listening_socket_is_valid() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(validate_fd(listener.as_raw_fd()));
    }

    #[test]
    fn test_invalid_fd_detection() {
        assert!(!validate_fd(9999));
        assert!(!validate_fd(-1));
    }

    #[test]
    fn test_unlistened_socket_is_rejected() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        assert!(!validate_fd(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_pipe_is_rejected() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(!validate_fd(fds[0]));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_cloexec_management() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();

        // std opens sockets close-on-exec
        assert!(cloexec_set(fd));

        set_cloexec(fd, false).unwrap();
        assert!(!cloexec_set(fd));

        set_cloexec(fd, true).unwrap();
        assert!(cloexec_set(fd));
    }

    #[tokio::test]
    async fn test_inherited_fd_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let dup = unsafe { libc::fcntl(listener.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 100) };
        assert!(dup >= 100, "dup failed");
        assert!(validate_fd(dup));

        let adopted = unsafe { std::net::TcpListener::from_raw_fd(dup) };
        adopted.set_nonblocking(true).unwrap();
        let adopted = TcpListener::from_std(adopted).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);

        // The original can go away; the duplicate keeps the socket alive.
        drop(listener);
        let client = tokio::net::TcpStream::connect(addr).await;
        assert!(client.is_ok());
        assert!(adopted.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_replacement_is_reaped() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "exit 3"]).stdin(Stdio::null());
        let pid = launch(command).unwrap();
        assert_ne!(pid, 0);

        // A zombie still answers kill(pid, 0); a reaped process does not.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "replacement {pid} was never reaped"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_launch_reports_spawn_failure() {
        let command = Command::new("/nonexistent/waddle-reloader-replacement");
        assert!(matches!(launch(command), Err(ReloadError::Spawn(_))));
    }

    #[test]
    fn test_fresh_process_is_not_resumed() {
        assert!(std::env::var_os(ENV_MARKER).is_none());
        assert!(!is_resume());
    }
}
