//! Restart eligibility for exited segments.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

pub const DEFAULT_MIN_AGE: Duration = Duration::from_millis(5000);

/// Which exits earn a replacement process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub on_signal: bool,
    pub on_error_exit: bool,
    pub on_normal_exit: bool,
    /// Segments that die younger than this are never restarted.
    pub min_age: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            on_signal: true,
            on_error_exit: true,
            on_normal_exit: true,
            min_age: DEFAULT_MIN_AGE,
        }
    }
}

/// How a segment process ended. A process killed by a signal has no code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (_, Some(signal)) => write!(f, "signal {}", signal),
            (Some(code), None) => write!(f, "code {}", code),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    EndOfLife,
}

impl RestartPolicy {
    /// First matching rule wins: an intentional close or a too-young segment
    /// is retired, then signal, error and normal exits are checked against
    /// their flags.
    pub fn decide(
        &self,
        intentional_close: bool,
        age: Duration,
        exit: ExitInfo,
    ) -> RestartDecision {
        if intentional_close || age < self.min_age {
            return RestartDecision::EndOfLife;
        }
        if exit.signal.is_some() && self.on_signal {
            return RestartDecision::Restart;
        }
        if !exit.is_success() && self.on_error_exit {
            return RestartDecision::Restart;
        }
        if exit.is_success() && self.on_normal_exit {
            return RestartDecision::Restart;
        }
        RestartDecision::EndOfLife
    }
}
