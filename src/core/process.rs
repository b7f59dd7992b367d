#![forbid(unsafe_code)]

use std::process::{Command, Stdio};

use crate::error::AgentqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn flag(self) -> &'static str {
        match self {
            Self::Term => "-TERM",
            Self::Kill => "-KILL",
        }
    }
}

#[must_use]
pub fn pid_exists(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Opaque token identifying one incarnation of `pid`, used to reject a
/// recycled pid. `None` when the process is gone or has exited (zombie).
#[must_use]
pub fn start_fingerprint(pid: u32) -> Option<String> {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        let (state, start) = parse_proc_stat(&stat)?;
        if state == 'Z' || state == 'X' {
            return None;
        }
        return Some(start.to_owned());
    }
    let out = Command::new("ps")
        .args(["-o", "lstart=", "-p", &pid.to_string()])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&out.stdout).trim().to_owned();
    (out.status.success() && !text.is_empty()).then_some(text)
}

/// Returns `(state, starttime)`. The command name is parenthesised and may
/// itself contain spaces or parentheses, so fields are counted after the last
/// `)`.
fn parse_proc_stat(stat: &str) -> Option<(char, &str)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // starttime is field 22 overall; state is field 3.
    let start = fields.nth(22 - 3 - 1)?;
    Some((state, start))
}

#[must_use]
pub fn is_alive(pid: u32, fingerprint: Option<&str>) -> bool {
    if pid == 0 || !pid_exists(pid) {
        return false;
    }
    match (start_fingerprint(pid), fingerprint) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(current), Some(expected)) => current == expected,
    }
}

pub fn send_signal(pid: u32, signal: Signal, group: bool) -> Result<(), AgentqError> {
    let target = if group {
        format!("-{pid}")
    } else {
        pid.to_string()
    };
    let status = Command::new("kill")
        .args([signal.flag(), "--", &target])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| AgentqError::ProviderProcess(format!("failed to run kill: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(AgentqError::ProviderProcess(format!(
            "kill {} {target} exited with {status}",
            signal.flag()
        )))
    }
}
