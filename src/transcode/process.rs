//! Platform helpers for tool processes

use std::io;
use tokio::process::{Child, Command};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Keep console tools from popping up a window on Windows
pub fn configure_command(cmd: &mut Command) {
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

/// Whether `terminate` kills outright instead of asking the tool to exit
pub const STOP_KILLS: bool = cfg!(not(unix));

/// Ask the process to terminate (SIGTERM). Does not wait.
#[cfg(unix)]
pub fn terminate(child: &mut Child) -> io::Result<()> {
    // None once the child has been reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };

    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Ask the process to terminate. Windows has no SIGTERM, so this kills it.
#[cfg(not(unix))]
pub fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
