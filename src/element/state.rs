//! Element states, status reports and task commands.

use std::fmt;

// ============================================================================
// Element State
// ============================================================================

/// Lifecycle state of an element.
///
/// The numeric codes are stable and ordered: everything at or after
/// [`Running`](Self::Running) has been opened at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ElementState {
    /// Not created.
    #[default]
    None = 0,
    /// Created, not started.
    Init = 1,
    /// `open` is running.
    Initializing = 2,
    /// Processing.
    Running = 3,
    /// Paused; the task is alive and waiting for commands.
    Paused = 4,
    /// Stopped by request or abort.
    Stopped = 5,
    /// Reached end of stream.
    Finished = 6,
    /// Failed to open or process.
    Error = 7,
}

impl ElementState {
    /// Numeric code of this state.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a numeric state code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::Init,
            2 => Self::Initializing,
            3 => Self::Running,
            4 => Self::Paused,
            5 => Self::Stopped,
            6 => Self::Finished,
            7 => Self::Error,
            _ => return None,
        })
    }

    /// Returns `true` for states a pipeline may (re)start an element from.
    pub fn is_startable(self) -> bool {
        matches!(self, Self::Init | Self::Stopped | Self::Finished | Self::Error)
    }
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Element Status
// ============================================================================

/// Status reported by an element through its event route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ElementStatus {
    /// No status.
    #[default]
    None = 0,
    /// `open` failed.
    ErrorOpen = 1,
    /// Reading the input failed.
    ErrorInput = 2,
    /// `process` failed.
    ErrorProcess = 3,
    /// Writing the output failed.
    ErrorOutput = 4,
    /// `close` failed.
    ErrorClose = 5,
    /// An operation timed out.
    ErrorTimeout = 6,
    /// Unclassified failure.
    ErrorUnknown = 7,
    /// Input reached end of stream.
    InputDone = 8,
    /// Input is buffering.
    InputBuffering = 9,
    /// Output reached end of stream.
    OutputDone = 10,
    /// Output is buffering.
    OutputBuffering = 11,
    /// Element entered `Running`.
    StateRunning = 12,
    /// Element entered `Paused`.
    StatePaused = 13,
    /// Element entered `Stopped`.
    StateStopped = 14,
    /// Element entered `Finished`.
    StateFinished = 15,
    /// Storage mounted.
    Mounted = 16,
    /// Storage unmounted.
    Unmounted = 17,
}

impl ElementStatus {
    /// Numeric code of this status.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a numeric status code.
    pub fn from_code(code: u8) -> Option<Self> {
        use ElementStatus::*;
        const ALL: [ElementStatus; 18] = [
            None,
            ErrorOpen,
            ErrorInput,
            ErrorProcess,
            ErrorOutput,
            ErrorClose,
            ErrorTimeout,
            ErrorUnknown,
            InputDone,
            InputBuffering,
            OutputDone,
            OutputBuffering,
            StateRunning,
            StatePaused,
            StateStopped,
            StateFinished,
            Mounted,
            Unmounted,
        ];
        ALL.get(code as usize).copied()
    }

    /// Returns `true` for the `Error*` statuses.
    pub fn is_error(self) -> bool {
        (1..=7).contains(&self.code())
    }

    /// Returns `true` for `StateStopped` and `StateFinished`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::StateStopped | Self::StateFinished)
    }
}

impl fmt::Display for ElementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Task Commands
// ============================================================================

/// Commands delivered to an element task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskCommand {
    Finish,
    Stop,
    Pause,
    Resume,
    Destroy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for code in 0..8 {
            let state = ElementState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(ElementState::from_code(8), None);
        assert!(ElementState::Running < ElementState::Paused);
    }

    #[test]
    fn test_status_codes() {
        for code in 0..18 {
            let status = ElementStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(ElementStatus::from_code(18), None);
        assert_eq!(ElementStatus::StateFinished.code(), 15);
    }

    #[test]
    fn test_status_classes() {
        assert!(ElementStatus::ErrorProcess.is_error());
        assert!(ElementStatus::ErrorUnknown.is_error());
        assert!(!ElementStatus::InputDone.is_error());
        assert!(!ElementStatus::None.is_error());
        assert!(ElementStatus::StateStopped.is_terminal());
        assert!(!ElementStatus::StatePaused.is_terminal());
    }

    #[test]
    fn test_startable_states() {
        assert!(ElementState::Init.is_startable());
        assert!(ElementState::Error.is_startable());
        assert!(!ElementState::Running.is_startable());
        assert!(!ElementState::Paused.is_startable());
    }
}
