//! Background mode
//!
//! Must run before the Tokio runtime is built: `fork()` only carries the
//! calling thread into the child.

use std::io;

/// Detach from the controlling terminal with a double fork
///
/// Returns `Ok(true)` in the daemon process, `Ok(false)` where detaching is
/// not supported. The launching and intermediate processes exit. Standard
/// input and output of the daemon point at `/dev/null`.
pub fn daemonize() -> io::Result<bool> {
    #[cfg(unix)]
    {
        use nix::unistd::{fork, setsid, ForkResult};

        // SAFETY: called before any runtime or worker thread exists, so the
        // process is single-threaded.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        setsid()?;

        // SAFETY: still single-threaded, as the first child of the fork above.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {}
        }

        std::env::set_current_dir("/")?;
        redirect_to_null(&[0, 1, 2])?;
        Ok(true)
    }

    #[cfg(not(unix))]
    {
        Ok(false)
    }
}

/// Point each descriptor in `fds` at `/dev/null`
#[cfg(unix)]
fn redirect_to_null(fds: &[std::os::fd::RawFd]) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for &fd in fds {
        nix::unistd::dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}
