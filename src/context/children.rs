//! Child Lifecycle Tracker
//!
//! Membership of child operations in the executing, executed and complete
//! sets, plus the once-only "all children complete" and "all children
//! committed" notifications owed to the owning task.

use crate::error::ContextError;
use crate::types::{ContextUid, OpId};
use std::collections::BTreeSet;

/// Stage a registered child is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStage {
    Executing,
    Executed,
    Complete,
}

impl ChildStage {
    /// Still counted against the admission window.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ChildStage::Executing | ChildStage::Executed)
    }
}

/// Callbacks that became due during a transition. Each is reported at most
/// once over the tracker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueCallbacks {
    pub complete: bool,
    pub commit: bool,
}

impl DueCallbacks {
    pub fn any(&self) -> bool {
        self.complete || self.commit
    }
}

#[derive(Debug)]
pub struct ChildTracker {
    context: ContextUid,
    executing: BTreeSet<OpId>,
    executed: BTreeSet<OpId>,
    complete: BTreeSet<OpId>,
    task_executed: bool,
    complete_invoked: bool,
    commit_invoked: bool,
}

impl ChildTracker {
    pub fn new(context: ContextUid) -> Self {
        Self {
            context,
            executing: BTreeSet::new(),
            executed: BTreeSet::new(),
            complete: BTreeSet::new(),
            task_executed: false,
            complete_invoked: false,
            commit_invoked: false,
        }
    }

    pub fn stage(&self, op: OpId) -> Option<ChildStage> {
        if self.executing.contains(&op) {
            Some(ChildStage::Executing)
        } else if self.executed.contains(&op) {
            Some(ChildStage::Executed)
        } else if self.complete.contains(&op) {
            Some(ChildStage::Complete)
        } else {
            None
        }
    }

    /// Reject a child that is already tracked.
    pub fn check_unregistered(&self, op: OpId) -> Result<(), ContextError> {
        match self.stage(op) {
            None => Ok(()),
            Some(_) => Err(ContextError::DuplicateChild {
                context: self.context,
                op,
            }),
        }
    }

    pub fn insert_executing(&mut self, op: OpId) -> Result<(), ContextError> {
        self.check_unregistered(op)?;
        self.executing.insert(op);
        Ok(())
    }

    pub fn mark_executed(&mut self, op: OpId) -> Result<(), ContextError> {
        if !self.executing.remove(&op) {
            return Err(self.unexpected(op, "executing"));
        }
        self.executed.insert(op);
        Ok(())
    }

    pub fn mark_complete(&mut self, op: OpId) -> Result<DueCallbacks, ContextError> {
        if !self.executed.remove(&op) {
            return Err(self.unexpected(op, "executed"));
        }
        self.complete.insert(op);
        Ok(self.take_due())
    }

    pub fn mark_committed(&mut self, op: OpId) -> Result<DueCallbacks, ContextError> {
        if !self.complete.remove(&op) {
            return Err(self.unexpected(op, "complete"));
        }
        Ok(self.take_due())
    }

    /// Remove `op` from whichever set holds it.
    pub fn unregister(&mut self, op: OpId) -> Result<(ChildStage, DueCallbacks), ContextError> {
        let stage = self
            .stage(op)
            .ok_or_else(|| self.unexpected(op, "registered"))?;
        match stage {
            ChildStage::Executing => self.executing.remove(&op),
            ChildStage::Executed => self.executed.remove(&op),
            ChildStage::Complete => self.complete.remove(&op),
        };
        Ok((stage, self.take_due()))
    }

    /// The owning task has stopped issuing children.
    pub fn finish_issuing(&mut self) -> DueCallbacks {
        self.task_executed = true;
        self.take_due()
    }

    pub fn task_executed(&self) -> bool {
        self.task_executed
    }

    /// Children not yet committed.
    pub fn outstanding(&self) -> usize {
        self.executing.len() + self.executed.len() + self.complete.len()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.executing.len(), self.executed.len(), self.complete.len())
    }

    pub fn callbacks_invoked(&self) -> DueCallbacks {
        DueCallbacks {
            complete: self.complete_invoked,
            commit: self.commit_invoked,
        }
    }

    fn take_due(&mut self) -> DueCallbacks {
        let mut due = DueCallbacks::default();
        if !self.task_executed {
            return due;
        }
        if !self.complete_invoked && self.executing.is_empty() && self.executed.is_empty() {
            self.complete_invoked = true;
            due.complete = true;
        }
        if !self.commit_invoked && self.complete_invoked && self.complete.is_empty() {
            self.commit_invoked = true;
            due.commit = true;
        }
        due
    }

    fn unexpected(&self, op: OpId, expected: &'static str) -> ContextError {
        ContextError::UnexpectedChildState {
            context: self.context,
            op,
            expected,
        }
    }
}
