//! Step definition graph: the immutable, versioned adjacency table of an
//! automation's steps and their typed edges.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JourneyError, JourneyResult};
use crate::predicate::Predicate;

/// Key of a step inside one definition's step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u32);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happens to the enrollment when a step's effect fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and follow the `next` edge.
    #[default]
    Continue,
    /// Terminate the enrollment as failed.
    Fail,
}

/// Upper bound on a wait step's duration or field-date offset (ten years).
pub const MAX_WAIT_SECS: u64 = 10 * 366 * 24 * 3600;

/// How long a wait step parks the enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum WaitSpec {
    /// Fixed delay from the moment the step executes.
    Duration { secs: u64 },
    /// Absolute instant.
    Until { at: DateTime<Utc> },
    /// RFC 3339 date read from the contact/trigger document, plus an offset
    /// (negative offsets wake before the date).
    FieldDate {
        field: String,
        #[serde(default)]
        offset_secs: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepKind {
    SendEmail {
        template_id: String,
        next: Option<StepId>,
        #[serde(default)]
        on_failure: FailurePolicy,
    },
    Wait {
        wait: WaitSpec,
        next: Option<StepId>,
    },
    Condition {
        predicate: Predicate,
        on_true: Option<StepId>,
        on_false: Option<StepId>,
    },
    AddTag {
        tag: String,
        next: Option<StepId>,
        #[serde(default)]
        on_failure: FailurePolicy,
    },
    RemoveTag {
        tag: String,
        next: Option<StepId>,
        #[serde(default)]
        on_failure: FailurePolicy,
    },
    UpdateField {
        key: String,
        value: Value,
        next: Option<StepId>,
        #[serde(default)]
        on_failure: FailurePolicy,
    },
    Webhook {
        url: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        next: Option<StepId>,
        #[serde(default)]
        on_failure: FailurePolicy,
    },
}

/// Flat label of a step kind, used in the execution log and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendEmail,
    Wait,
    Condition,
    AddTag,
    RemoveTag,
    UpdateField,
    Webhook,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SendEmail => "send_email",
            StepType::Wait => "wait",
            StepType::Condition => "condition",
            StepType::AddTag => "add_tag",
            StepType::RemoveTag => "remove_tag",
            StepType::UpdateField => "update_field",
            StepType::Webhook => "webhook",
        }
    }

    /// Whether the step calls out to an external collaborator.
    pub fn has_side_effect(&self) -> bool {
        !matches!(self, StepType::Wait | StepType::Condition)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::SendEmail { .. } => StepType::SendEmail,
            StepKind::Wait { .. } => StepType::Wait,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::AddTag { .. } => StepType::AddTag,
            StepKind::RemoveTag { .. } => StepType::RemoveTag,
            StepKind::UpdateField { .. } => StepType::UpdateField,
            StepKind::Webhook { .. } => StepType::Webhook,
        }
    }

    /// Outgoing edges of the step, in declaration order.
    pub fn edges(&self) -> Vec<StepId> {
        match self {
            StepKind::Condition {
                on_true, on_false, ..
            } => on_true.iter().chain(on_false.iter()).copied().collect(),
            _ => self.next().into_iter().collect(),
        }
    }

    /// The single "next" edge of a linear step. Condition steps return `None`.
    pub fn next(&self) -> Option<StepId> {
        match self {
            StepKind::SendEmail { next, .. }
            | StepKind::Wait { next, .. }
            | StepKind::AddTag { next, .. }
            | StepKind::RemoveTag { next, .. }
            | StepKind::UpdateField { next, .. }
            | StepKind::Webhook { next, .. } => *next,
            StepKind::Condition { .. } => None,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            StepKind::SendEmail { on_failure, .. }
            | StepKind::AddTag { on_failure, .. }
            | StepKind::RemoveTag { on_failure, .. }
            | StepKind::UpdateField { on_failure, .. }
            | StepKind::Webhook { on_failure, .. } => *on_failure,
            StepKind::Wait { .. } | StepKind::Condition { .. } => FailurePolicy::Continue,
        }
    }

    fn validate(&self, id: StepId) -> JourneyResult<()> {
        let invalid = |msg: String| Err(JourneyError::validation(format!("step {id}: {msg}")));
        match self {
            StepKind::SendEmail { template_id, .. } if template_id.trim().is_empty() => {
                invalid("send_email needs a template_id".into())
            }
            StepKind::Wait { next: None, .. } => invalid("wait step must have a next step".into()),
            StepKind::Wait {
                wait: WaitSpec::Duration { secs: 0 },
                ..
            } => invalid("wait duration must be positive".into()),
            StepKind::Wait {
                wait: WaitSpec::Duration { secs },
                ..
            } if *secs > MAX_WAIT_SECS => {
                invalid(format!("wait duration must not exceed {MAX_WAIT_SECS}s"))
            }
            StepKind::Wait {
                wait: WaitSpec::FieldDate { offset_secs, .. },
                ..
            } if offset_secs.unsigned_abs() > MAX_WAIT_SECS => {
                invalid(format!("wait offset must not exceed {MAX_WAIT_SECS}s"))
            }
            StepKind::Wait {
                wait: WaitSpec::FieldDate { field, .. },
                ..
            } if field.trim().is_empty() => invalid("wait field must not be empty".into()),
            StepKind::Condition { predicate, .. } => predicate
                .validate()
                .map_err(|e| JourneyError::validation(format!("step {id}: {e}"))),
            StepKind::AddTag { tag, .. } | StepKind::RemoveTag { tag, .. }
                if tag.trim().is_empty() =>
            {
                invalid("tag must not be empty".into())
            }
            StepKind::UpdateField { key, .. } if key.trim().is_empty() => {
                invalid("update_field needs a key".into())
            }
            StepKind::Webhook { url, .. }
                if !(url.starts_with("https://") || url.starts_with("http://")) =>
            {
                invalid(format!("webhook url '{url}' must be http(s)"))
            }
            _ => Ok(()),
        }
    }
}

/// A single node of the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub action: StepKind,
}

impl Step {
    pub fn new(id: u32, action: StepKind) -> Self {
        Self {
            id: StepId(id),
            name: None,
            action,
        }
    }
}

/// Wire shape of a step graph; converted through [`StepGraph::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepGraphSpec {
    pub start: StepId,
    pub steps: Vec<Step>,
}

/// A validated step graph. Every edge targets an existing step, every step is
/// reachable from `start`, and every cycle passes through a wait step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepGraphSpec", into = "StepGraphSpec")]
pub struct StepGraph {
    start: StepId,
    steps: BTreeMap<StepId, Step>,
}

impl StepGraph {
    pub fn new(start: StepId, steps: Vec<Step>) -> JourneyResult<Self> {
        if steps.is_empty() {
            return Err(JourneyError::validation("automation has no steps"));
        }

        let mut table = BTreeMap::new();
        for step in steps {
            step.action.validate(step.id)?;
            let id = step.id;
            if table.insert(id, step).is_some() {
                return Err(JourneyError::validation(format!("duplicate step id {id}")));
            }
        }

        if !table.contains_key(&start) {
            return Err(JourneyError::validation(format!(
                "start step {start} does not exist"
            )));
        }

        for step in table.values() {
            for target in step.action.edges() {
                if !table.contains_key(&target) {
                    return Err(JourneyError::validation(format!(
                        "step {} points to unknown step {target}",
                        step.id
                    )));
                }
            }
        }

        let graph = Self { start, steps: table };
        graph.check_reachability()?;
        graph.check_tight_loops()?;
        Ok(graph)
    }

    pub fn start(&self) -> StepId {
        self.start
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.get(&id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn check_reachability(&self) -> JourneyResult<()> {
        let mut seen = BTreeSet::from([self.start]);
        let mut queue = VecDeque::from([self.start]);
        while let Some(id) = queue.pop_front() {
            if let Some(step) = self.steps.get(&id) {
                for target in step.action.edges() {
                    if seen.insert(target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        if let Some(orphan) = self.steps.keys().find(|id| !seen.contains(id)) {
            return Err(JourneyError::validation(format!(
                "step {orphan} is unreachable from start step {}",
                self.start
            )));
        }
        Ok(())
    }

    /// Rejects cycles that contain no wait step. Edges leaving a wait step
    /// are dropped, so any remaining cycle would spin without a pause.
    fn check_tight_loops(&self) -> JourneyResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Done,
        }

        let mut marks: BTreeMap<StepId, Mark> = BTreeMap::new();
        for &root in self.steps.keys() {
            if marks.contains_key(&root) {
                continue;
            }
            let mut stack: Vec<(StepId, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::Open);
            while let Some((id, cursor)) = stack.pop() {
                let edges = self.pause_free_edges(id);
                if let Some(&target) = edges.get(cursor) {
                    stack.push((id, cursor + 1));
                    match marks.get(&target) {
                        Some(Mark::Open) => {
                            return Err(JourneyError::validation(format!(
                                "steps {target} and {id} form a loop without a wait step"
                            )));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(target, Mark::Open);
                            stack.push((target, 0));
                        }
                    }
                } else {
                    marks.insert(id, Mark::Done);
                }
            }
        }
        Ok(())
    }

    fn pause_free_edges(&self, id: StepId) -> Vec<StepId> {
        match self.steps.get(&id) {
            Some(step) if step.action.step_type() != StepType::Wait => step.action.edges(),
            _ => Vec::new(),
        }
    }
}

impl TryFrom<StepGraphSpec> for StepGraph {
    type Error = JourneyError;

    fn try_from(spec: StepGraphSpec) -> Result<Self, Self::Error> {
        StepGraph::new(spec.start, spec.steps)
    }
}

impl From<StepGraph> for StepGraphSpec {
    fn from(graph: StepGraph) -> Self {
        StepGraphSpec {
            start: graph.start,
            steps: graph.steps.into_values().collect(),
        }
    }
}
