//! Operation scheduling.
//!
//! Recovery operations are re-entrant state machines: each invocation
//! executes one or more states, records durable progress, and either
//! completes or yields to be invoked again. The processor guarantees the
//! two scheduling contracts the machines rely on:
//!
//! - a single in-flight invocation per operation id
//! - an operation does not run while any live operation obstructs one of
//!   its dependencies
//!
//! This implementation drives operations cooperatively on the calling
//! thread until the set quiesces, which is all the recovery core needs;
//! production deployments put the same contract behind a worker pool.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::Error;

/// Observable states of a recovery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum OperationState {
    Initial = 0,
    IssueRequests = 1,
    Prepare = 2,
    Commit = 3,
    Acknowledge = 4,
    Finalize = 5,
}

impl OperationState {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Initial),
            1 => Some(Self::IssueRequests),
            2 => Some(Self::Prepare),
            3 => Some(Self::Commit),
            4 => Some(Self::Acknowledge),
            5 => Some(Self::Finalize),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::IssueRequests => "ISSUE_REQUESTS",
            Self::Prepare => "PREPARE",
            Self::Commit => "COMMIT",
            Self::Acknowledge => "ACKNOWLEDGE",
            Self::Finalize => "FINALIZE",
        }
    }
}

/// Terminal status of an operation.
#[derive(Debug)]
pub enum OperationStatus {
    InProgress,
    CompleteOk,
    CompleteError(Error),
}

impl OperationStatus {
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::CompleteOk)
    }
}

/// A re-entrant recovery state machine.
pub trait Operation: Send {
    fn id(&self) -> i64;

    fn label(&self) -> String;

    fn status(&self) -> &OperationStatus;

    /// Names this operation must see quiet before running.
    fn dependencies(&self) -> BTreeSet<String>;

    /// Names this operation keeps busy while alive.
    fn obstructions(&self) -> BTreeSet<String>;

    /// Executes one scheduling quantum. Returns operations spawned
    /// during this invocation.
    fn execute(&mut self) -> Vec<Box<dyn Operation>>;
}

/// Cooperative dependency-aware driver.
#[derive(Default)]
pub struct OperationProcessor {
    operations: Vec<Box<dyn Operation>>,
}

impl OperationProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_operation(&mut self, operation: Box<dyn Operation>) {
        self.operations.push(operation);
    }

    fn blocked(&self, index: usize) -> bool {
        let dependencies = self.operations[index].dependencies();
        if dependencies.is_empty() {
            return false;
        }
        self.operations.iter().enumerate().any(|(other, op)| {
            other != index
                && !op.status().is_complete()
                && !op.obstructions().is_disjoint(&dependencies)
        })
    }

    /// Drives every operation to completion.
    ///
    /// Returns the completed operations. Panics if the set wedges with
    /// live operations that are all blocked; that means a dependency
    /// cycle, a programmer error in edge construction.
    pub fn run_to_completion(mut self) -> Vec<Box<dyn Operation>> {
        loop {
            let mut progressed = false;
            let mut spawned = Vec::new();
            for index in 0..self.operations.len() {
                if self.operations[index].status().is_complete() || self.blocked(index) {
                    continue;
                }
                spawned.extend(self.operations[index].execute());
                progressed = true;
                if let OperationStatus::CompleteError(error) = self.operations[index].status() {
                    warn!(
                        label = %self.operations[index].label(),
                        %error,
                        "operation completed with error"
                    );
                }
            }
            self.operations.extend(spawned);
            if self.operations.iter().all(|op| op.status().is_complete()) {
                info!(count = self.operations.len(), "operation set quiesced");
                return self.operations;
            }
            assert!(progressed, "operation set wedged: dependency cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct ScriptedOp {
        id: i64,
        steps: u32,
        status: OperationStatus,
        obstructions: BTreeSet<String>,
        dependencies: BTreeSet<String>,
        trace: Arc<Mutex<Vec<i64>>>,
    }

    impl Operation for ScriptedOp {
        fn id(&self) -> i64 {
            self.id
        }

        fn label(&self) -> String {
            format!("scripted-{}", self.id)
        }

        fn status(&self) -> &OperationStatus {
            &self.status
        }

        fn dependencies(&self) -> BTreeSet<String> {
            self.dependencies.clone()
        }

        fn obstructions(&self) -> BTreeSet<String> {
            self.obstructions.clone()
        }

        fn execute(&mut self) -> Vec<Box<dyn Operation>> {
            self.trace.lock().unwrap().push(self.id);
            self.steps -= 1;
            if self.steps == 0 {
                self.status = OperationStatus::CompleteOk;
            }
            Vec::new()
        }
    }

    fn op(
        id: i64,
        steps: u32,
        obstructs: &[&str],
        depends: &[&str],
        trace: &Arc<Mutex<Vec<i64>>>,
    ) -> Box<dyn Operation> {
        Box::new(ScriptedOp {
            id,
            steps,
            status: OperationStatus::InProgress,
            obstructions: obstructs.iter().map(ToString::to_string).collect(),
            dependencies: depends.iter().map(ToString::to_string).collect(),
            trace: trace.clone(),
        })
    }

    #[test]
    fn dependent_op_waits_for_obstruction_to_clear() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut processor = OperationProcessor::new();
        processor.add_operation(op(2, 1, &[], &["ROOT"], &trace));
        processor.add_operation(op(1, 3, &["ROOT"], &[], &trace));

        let done = processor.run_to_completion();
        assert!(done.iter().all(|op| op.status().is_ok()));
        // op 2 only ran after op 1 finished its three steps
        assert_eq!(*trace.lock().unwrap(), vec![1, 1, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "dependency cycle")]
    fn cyclic_dependencies_wedge() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut processor = OperationProcessor::new();
        processor.add_operation(op(1, 1, &["A"], &["B"], &trace));
        processor.add_operation(op(2, 1, &["B"], &["A"], &trace));
        processor.run_to_completion();
    }
}
