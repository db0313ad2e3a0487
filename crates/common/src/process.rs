//! Process liveness probes.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Check whether `pid` refers to a live process.
///
/// `kill(pid, 0)` probes without signaling; EPERM means the process exists
/// but belongs to another user, which still counts as alive. `/proc` is the
/// fallback when the probe fails for any other reason.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => Path::new("/proc").join(pid.to_string()).exists(),
    }
}
