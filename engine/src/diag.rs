// diag.rs — Unified diagnostics model
//
// Diagnostics collected during an evaluation pass. Compute failures and
// region runtime faults never abort a pass; they poison the affected slots
// and leave a diagnostic here for the caller to surface.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::{InstanceId, RegionId};

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered diagnostic codes.
pub mod codes {
    use super::DiagCode;

    /// An operator's compute function reported a failure.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// A connection's implicit conversion rejected the value.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// An operator returned the wrong number of outputs.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// A requested output is poisoned by a failure diagnosed in an earlier pass.
    pub const E0103: DiagCode = DiagCode("E0103");
    /// A splicer port received a value that is not a sequence.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// A conditional guard did not evaluate to a boolean.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// A region border port was read outside of its region.
    pub const E0202: DiagCode = DiagCode("E0202");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted while evaluating the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub instance: Option<InstanceId>,
    pub region: Option<RegionId>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, location or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            instance: None,
            region: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the instance the diagnostic is about.
    pub fn at_instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn at_region(mut self, region: RegionId) -> Self {
        self.region = Some(region);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]", level, code)?;
        } else {
            write!(f, "{}", level)?;
        }
        match (self.instance, self.region) {
            (Some(instance), _) => write!(f, " at {}", instance)?,
            (None, Some(region)) => write!(f, " at {}", region)?,
            (None, None) => {}
        }
        write!(f, ": {}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_instance() {
        let d = Diagnostic::error(codes::E0100, "division by zero").at_instance(InstanceId(3));
        assert_eq!(format!("{d}"), "error[E0100] at n3: division by zero");
    }

    #[test]
    fn display_with_hint() {
        let d = Diagnostic::new(DiagLevel::Warning, "guard is not a boolean")
            .with_code(codes::E0201)
            .at_region(RegionId(2))
            .with_hint("connect a Bool output to the guard port");
        assert_eq!(
            format!("{d}"),
            "warning[E0201] at r2: guard is not a boolean\n  hint: connect a Bool output to the guard port"
        );
        assert!(!has_errors(&[d]));
    }
}
