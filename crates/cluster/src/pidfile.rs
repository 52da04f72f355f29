//! PID file handling and master signal fan-out.
//!
//! The file holds a single ASCII decimal line with the master PID and is
//! removed on clean shutdown. External tooling locates the master through
//! it and signals the master only; the master translates into per-child
//! signals.

use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::supervisor::SupervisorError;

pub fn write_pid_file(path: &Path) -> Result<(), SupervisorError> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n")).map_err(|err| {
        SupervisorError::PidFile(format!("write {}: {err}", path.display()))
    })
}

pub fn read_pid_file(path: &Path) -> Result<i32, SupervisorError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        SupervisorError::PidFile(format!("read {}: {err}", path.display()))
    })?;
    text.trim().parse().map_err(|_| {
        SupervisorError::PidFile(format!(
            "{} does not contain a decimal pid",
            path.display()
        ))
    })
}

pub fn remove_pid_file(path: &Path) {
    // Absence at shutdown is fine.
    let _ = std::fs::remove_file(path);
}

/// Send a signal to the master named by the PID file.
pub fn signal_master(path: &Path, signal: Signal) -> Result<(), SupervisorError> {
    let pid = read_pid_file(path)?;
    kill(Pid::from_raw(pid), signal).map_err(|err| {
        SupervisorError::PidFile(format!("signal pid {pid}: {err}"))
    })
}
