//! Queries against the host process table.

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;

/// What a recorded PID turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// Alive and running the expected command line.
    Live,

    /// No such process (or a zombie).
    Dead,

    /// Alive, but running something else; the PID was recycled.
    Mismatched,
}

pub(crate) fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Whether `pid` names a live, non-zombie process.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };

    match signal::kill(pid, None) {
        Ok(()) => !is_zombie(pid),
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
const fn is_zombie(_pid: Pid) -> bool {
    false
}

/// Command line of a live process, if the platform exposes it.
#[cfg(target_os = "linux")]
#[must_use]
pub fn command_line(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }

    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect(),
    )
}

/// Command line of a live process, if the platform exposes it.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub const fn command_line(_pid: u32) -> Option<Vec<String>> {
    None
}

/// Checks a recorded PID against the command line it was spawned with.
///
/// Where the platform does not expose command lines a live PID is trusted.
#[must_use]
pub fn check(pid: u32, expected: &[String]) -> PidState {
    if !is_alive(pid) {
        return PidState::Dead;
    }

    match command_line(pid) {
        Some(actual) if actual == expected => PidState::Live,
        Some(_) => PidState::Mismatched,
        None if cfg!(target_os = "linux") => PidState::Mismatched,
        None => PidState::Live,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_check_detects_mismatch() {
        let own = std::process::id();
        let actual = command_line(own).unwrap();

        assert_eq!(check(own, &actual), PidState::Live);
        assert_eq!(
            check(own, &["/bin/definitely-not-this".to_string()]),
            PidState::Mismatched
        );
    }

    #[test]
    fn test_check_detects_dead_process() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert_eq!(check(pid, &[]), PidState::Dead);
    }
}
