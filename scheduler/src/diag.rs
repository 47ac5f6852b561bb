// diag.rs — Error taxonomy and diagnostics model
//
// `ScheduleError` is the single error type returned by every scheduling
// phase. Each variant maps to a stable diagnostic code so the driver can
// render it as a `Diagnostic` without string matching.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use thiserror::Error;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered diagnostic codes.
///
/// `E01xx` stream-graph structure, `E03xx` rates and schedules,
/// `E04xx` SDEP and messaging, `E09xx` internal defects.
pub mod codes {
    use super::DiagCode;

    pub const E0100: DiagCode = DiagCode("E0100"); // malformed stream graph
    pub const E0101: DiagCode = DiagCode("E0101"); // unknown work unit name
    pub const E0102: DiagCode = DiagCode("E0102"); // unreadable graph input
    pub const E0300: DiagCode = DiagCode("E0300"); // unschedulable rates
    pub const E0301: DiagCode = DiagCode("E0301"); // insufficient feedback delay
    pub const E0302: DiagCode = DiagCode("E0302"); // multiplicity overflow
    pub const E0400: DiagCode = DiagCode("E0400"); // no dependency path
    pub const E0401: DiagCode = DiagCode("E0401"); // no sender/receiver relationship
    pub const E0402: DiagCode = DiagCode("E0402"); // invalid latency window
    pub const E0403: DiagCode = DiagCode("E0403"); // missed message delivery
    pub const E0900: DiagCode = DiagCode("E0900"); // internal invariant violated
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Error taxonomy ───────────────────────────────────────────────────────

/// Every failure the scheduler can report.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("malformed stream graph at '{stream}': {detail}")]
    MalformedGraph { stream: String, detail: String },

    #[error("unschedulable rates in '{stream}': {detail}")]
    UnschedulableRate { stream: String, detail: String },

    #[error("feedback loop '{stream}' cannot run with delay {delay}: {detail}")]
    InsufficientDelay {
        stream: String,
        delay: u64,
        detail: String,
    },

    #[error("multiplicities or item counts of '{stream}' do not fit in 64 bits")]
    RateOverflow { stream: String },

    #[error("no dependency path from '{upstream}' to '{downstream}'")]
    NoPath { upstream: String, downstream: String },

    #[error("receiver '{receiver}' is neither upstream nor downstream of sender '{sender}'")]
    NoRelationship { sender: String, receiver: String },

    #[error("invalid latency window: min {min} exceeds max {max}")]
    InvalidLatency { min: u64, max: u64 },

    #[error("message to '{receiver}' due after execution {due} is still queued at execution {current}")]
    MissedDelivery {
        receiver: String,
        due: u64,
        current: u64,
    },

    #[error("unknown work unit '{name}'")]
    UnknownUnit { name: String },

    #[error("internal scheduler error: {context}")]
    Internal { context: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stream graph description: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

impl ScheduleError {
    pub fn internal(context: impl Into<String>) -> Self {
        ScheduleError::Internal {
            context: context.into(),
        }
    }

    pub fn code(&self) -> DiagCode {
        match self {
            ScheduleError::MalformedGraph { .. } => codes::E0100,
            ScheduleError::UnknownUnit { .. } => codes::E0101,
            ScheduleError::Io { .. } | ScheduleError::Json(_) => codes::E0102,
            ScheduleError::UnschedulableRate { .. } => codes::E0300,
            ScheduleError::InsufficientDelay { .. } => codes::E0301,
            ScheduleError::RateOverflow { .. } => codes::E0302,
            ScheduleError::NoPath { .. } => codes::E0400,
            ScheduleError::NoRelationship { .. } => codes::E0401,
            ScheduleError::InvalidLatency { .. } => codes::E0402,
            ScheduleError::MissedDelivery { .. } => codes::E0403,
            ScheduleError::Internal { .. } => codes::E0900,
        }
    }

    /// True for defects in the scheduler itself rather than in its input.
    pub fn is_internal(&self) -> bool {
        matches!(self, ScheduleError::Internal { .. })
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A rendered diagnostic for the command-line driver.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<&ScheduleError> for Diagnostic {
    fn from(err: &ScheduleError) -> Self {
        let diag = Diagnostic::new(DiagLevel::Error, err.to_string()).with_code(err.code());
        match err {
            ScheduleError::InsufficientDelay { .. } => {
                diag.with_hint("increase the feedback delay or the loop path's initial output")
            }
            ScheduleError::UnschedulableRate { .. } => {
                diag.with_hint("check that producer and consumer rates admit a periodic schedule")
            }
            ScheduleError::Internal { .. } => diag.with_hint("this is a scheduler defect"),
            _ => diag,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
