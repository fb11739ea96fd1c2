//! Induced-failure hooks.
//!
//! State machines in the recovery core carry named probe points
//! ("recover-server-INITIAL-a", "recover-server-ranges-user-INITIAL-b",
//! ...). A [`FailureInducer`] installed at process start arms some of
//! those labels: when an armed probe's iteration counter reaches its
//! trigger, the probe either returns an error or exits the process,
//! letting tests and operators exercise every restart path without
//! touching the machinery under test.
//!
//! Probes are free when no inducer is installed.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;
use tracing::error;

static INSTANCE: OnceLock<FailureInducer> = OnceLock::new();

/// Error returned by a triggered `throw` probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("induced failure code '{code}' '{label}' iteration={iteration}")]
pub struct InducedFailure {
    pub label: String,
    pub code: i32,
    pub iteration: u32,
}

/// Default error code for `throw` probes with no explicit code.
pub const INDUCED_FAILURE_CODE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    Exit,
    Throw { code: i32 },
}

#[derive(Debug)]
struct ProbeState {
    action: FailureAction,
    trigger_iteration: u32,
    iteration: u32,
}

/// Process-wide registry of armed failure probes.
#[derive(Debug, Default)]
pub struct FailureInducer {
    probes: Mutex<HashMap<String, ProbeState>>,
}

/// Errors from parsing inducer option strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed inducer option '{0}': expected label:type:occurrence")]
    Malformed(String),

    #[error("unknown failure type '{0}'")]
    UnknownType(String),

    #[error("invalid occurrence count '{0}'")]
    BadOccurrence(String),
}

impl FailureInducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `inducer` as the process-wide instance. Later installs
    /// are ignored; the first one wins.
    pub fn install(inducer: FailureInducer) -> &'static FailureInducer {
        INSTANCE.get_or_init(|| inducer)
    }

    /// The installed instance, if any.
    pub fn instance() -> Option<&'static FailureInducer> {
        INSTANCE.get()
    }

    /// Parses and arms one `label:type:occurrence` option.
    ///
    /// `type` is `exit` or `throw`, optionally `throw(code)` with a
    /// decimal or `0x` hexadecimal error code.
    pub fn parse_option(&self, option: &str) -> Result<(), ParseError> {
        let mut parts = option.splitn(3, ':');
        let (Some(label), Some(failure_type), Some(occurrence)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::Malformed(option.to_string()));
        };

        let action = if failure_type == "exit" {
            FailureAction::Exit
        } else if let Some(rest) = failure_type.strip_prefix("throw") {
            let code = match rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
                None if rest.is_empty() => INDUCED_FAILURE_CODE,
                Some(code_text) => {
                    let parsed = if let Some(hex) = code_text
                        .strip_prefix("0x")
                        .or_else(|| code_text.strip_prefix("0X"))
                    {
                        i32::from_str_radix(hex, 16)
                    } else {
                        code_text.parse()
                    };
                    parsed.map_err(|_| ParseError::UnknownType(failure_type.to_string()))?
                }
                None => return Err(ParseError::UnknownType(failure_type.to_string())),
            };
            FailureAction::Throw { code }
        } else {
            return Err(ParseError::UnknownType(failure_type.to_string()));
        };

        let trigger_iteration = occurrence
            .parse()
            .map_err(|_| ParseError::BadOccurrence(occurrence.to_string()))?;

        self.probes.lock().unwrap().insert(
            label.to_string(),
            ProbeState {
                action,
                trigger_iteration,
                iteration: 0,
            },
        );
        Ok(())
    }

    /// Probes `label`: fails if the label is armed and its counter has
    /// reached the trigger, otherwise advances the counter.
    ///
    /// A triggered `throw` probe disarms itself so a restarted operation
    /// passes on the next visit.
    pub fn maybe_fail(&self, label: &str) -> Result<(), InducedFailure> {
        let mut probes = self.probes.lock().unwrap();
        let Some(state) = probes.get_mut(label) else {
            return Ok(());
        };
        if state.iteration != state.trigger_iteration {
            state.iteration += 1;
            return Ok(());
        }
        match state.action {
            FailureAction::Throw { code } => {
                let failure = InducedFailure {
                    label: label.to_string(),
                    code,
                    iteration: state.iteration,
                };
                probes.remove(label);
                Err(failure)
            }
            FailureAction::Exit => {
                error!(label, iteration = state.iteration, "induced process exit");
                std::process::exit(1);
            }
        }
    }

    /// Disarms every probe.
    pub fn clear(&self) {
        self.probes.lock().unwrap().clear();
    }
}

/// Probes the installed inducer, if any.
///
/// The call sites are the named sites of the recovery state machines;
/// with no inducer installed this is a map-free early return.
pub fn maybe_fail(label: &str) -> Result<(), InducedFailure> {
    match FailureInducer::instance() {
        Some(inducer) => inducer.maybe_fail(label),
        None => Ok(()),
    }
}
