//! Step Registry
//!
//! Holds the static graph of one workflow definition: step definitions in
//! declaration order, their outgoing edges and guards, and their interrupt
//! modes. Resolves the next target for a run and validates the graph before
//! any run is created.

use crate::approval::{ApprovalDecision, InterruptMode};
use crate::error::{EngineError, StepError, ValidationError};
use crate::retry::RetryPolicy;
use crate::types::{DefinitionId, StepId, StepRecord, WorkflowRun};
use crate::unit::StepUnit;
use indexmap::IndexMap;
use jsonschema::JSONSchema;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate over run state for custom guards
pub type GuardFn = Arc<dyn Fn(&WorkflowRun) -> bool + Send + Sync>;

/// Edge guard, evaluated against the run snapshot
#[derive(Clone)]
pub enum Guard {
    /// The latest decision recorded at `step` is approve
    Approved(StepId),
    /// The latest decision recorded at `step` is reject
    Rejected(StepId),
    /// The JSON pointer into `step`'s result equals `value`
    ResultEquals {
        /// Producer of the result
        step: StepId,
        /// RFC 6901 pointer into the result
        pointer: String,
        /// Expected value
        value: Value,
    },
    /// Arbitrary predicate over the run
    Custom {
        /// Label shown in `Debug` output
        name: String,
        /// The check itself
        predicate: GuardFn,
    },
}

impl Guard {
    /// Named guard around a closure
    pub fn custom(
        name: impl Into<String>,
        predicate: impl Fn(&WorkflowRun) -> bool + Send + Sync + 'static,
    ) -> Self {
        Guard::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Guard comparing part of a step result with `value`
    pub fn result_equals(step: impl Into<StepId>, pointer: impl Into<String>, value: Value) -> Self {
        Guard::ResultEquals {
            step: step.into(),
            pointer: pointer.into(),
            value,
        }
    }

    /// Whether the edge may be taken for `run`
    #[must_use]
    pub fn evaluate(&self, run: &WorkflowRun) -> bool {
        match self {
            Guard::Approved(step) => run
                .decision(step.as_str())
                .is_some_and(|d| d.decision == ApprovalDecision::Approve),
            Guard::Rejected(step) => run
                .decision(step.as_str())
                .is_some_and(|d| d.decision == ApprovalDecision::Reject),
            Guard::ResultEquals {
                step,
                pointer,
                value,
            } => run
                .result(step.as_str())
                .and_then(|r| r.pointer(pointer))
                .is_some_and(|found| found == value),
            Guard::Custom { predicate, .. } => predicate(run),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Approved(step) => write!(f, "Approved({step})"),
            Guard::Rejected(step) => write!(f, "Rejected({step})"),
            Guard::ResultEquals {
                step,
                pointer,
                value,
            } => write!(f, "ResultEquals({step}{pointer} == {value})"),
            Guard::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

/// Where an edge leads
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeTarget {
    /// Continue at this step
    Step(StepId),
    /// Terminal marker: resolving to it completes the run
    End,
}

impl From<&str> for EdgeTarget {
    fn from(value: &str) -> Self {
        EdgeTarget::Step(value.into())
    }
}

impl From<StepId> for EdgeTarget {
    fn from(value: StepId) -> Self {
        EdgeTarget::Step(value)
    }
}

/// Outgoing edge of a step
#[derive(Debug, Clone)]
pub struct Edge {
    /// Destination
    pub to: EdgeTarget,
    /// Unguarded edges always match
    pub guard: Option<Guard>,
}

/// What executing a step means
#[derive(Clone)]
pub enum StepKind {
    /// Invoke a unit and store its result
    Task(Arc<dyn StepUnit>),
    /// Human approval gate: no unit, always pauses before
    Approval,
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Task(_) => f.write_str("Task"),
            StepKind::Approval => f.write_str("Approval"),
        }
    }
}

/// Static declaration of one step
#[derive(Debug, Clone)]
pub struct StepDefinition {
    /// Unique within the definition
    pub id: StepId,
    /// Display name, defaults to the id
    pub name: String,
    /// Task or approval gate
    pub kind: StepKind,
    /// Outgoing edges, evaluated in order
    pub edges: Vec<Edge>,
    /// Falls back to the engine default when unset
    pub retry: Option<RetryPolicy>,
    /// Per-invocation limit, engine default when unset
    pub timeout: Option<Duration>,
    /// Static interrupt point on this step
    pub interrupt: Option<InterruptMode>,
    /// JSON Schema every result must satisfy
    pub output_schema: Option<Value>,
}

impl StepDefinition {
    fn with_kind(id: impl Into<StepId>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            kind,
            edges: Vec::new(),
            retry: None,
            timeout: None,
            interrupt: None,
            output_schema: None,
        }
    }

    /// Task step backed by `unit`
    pub fn task(id: impl Into<StepId>, unit: Arc<dyn StepUnit>) -> Self {
        Self::with_kind(id, StepKind::Task(unit))
    }

    /// Human approval gate
    pub fn approval(id: impl Into<StepId>) -> Self {
        Self::with_kind(id, StepKind::Approval)
    }

    /// Override the display name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Unguarded default edge
    #[must_use]
    pub fn then(mut self, to: impl Into<EdgeTarget>) -> Self {
        self.edges.push(Edge {
            to: to.into(),
            guard: None,
        });
        self
    }

    /// Edge taken only when `guard` holds
    #[must_use]
    pub fn then_when(mut self, guard: Guard, to: impl Into<EdgeTarget>) -> Self {
        self.edges.push(Edge {
            to: to.into(),
            guard: Some(guard),
        });
        self
    }

    /// Unguarded edge to the terminal marker
    #[must_use]
    pub fn finish(self) -> Self {
        self.then(EdgeTarget::End)
    }

    /// Branch taken when the reviewer approves
    #[must_use]
    pub fn on_approve(self, to: impl Into<EdgeTarget>) -> Self {
        let guard = Guard::Approved(self.id.clone());
        self.then_when(guard, to)
    }

    /// Rework branch taken when the reviewer rejects
    #[must_use]
    pub fn on_reject(self, to: impl Into<EdgeTarget>) -> Self {
        let guard = Guard::Rejected(self.id.clone());
        self.then_when(guard, to)
    }

    /// Step-specific retry policy
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Step-specific invocation limit
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Always interrupt before this step
    #[must_use]
    pub fn pause_before(mut self) -> Self {
        self.interrupt = Some(InterruptMode::Before);
        self
    }

    /// Always interrupt after this step for review
    #[must_use]
    pub fn pause_after(mut self) -> Self {
        self.interrupt = Some(InterruptMode::After);
        self
    }

    /// Validate results against `schema`
    #[must_use]
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Approval gates have no unit
    #[inline]
    #[must_use]
    pub fn is_approval(&self) -> bool {
        matches!(self.kind, StepKind::Approval)
    }

    /// Interrupt mode, with approval gates always pausing before
    #[must_use]
    pub fn interrupt_mode(&self) -> Option<InterruptMode> {
        if self.is_approval() {
            Some(InterruptMode::Before)
        } else {
            self.interrupt
        }
    }
}

/// Static step graph of one workflow definition
pub struct StepRegistry {
    definition_id: DefinitionId,
    steps: IndexMap<StepId, StepDefinition>,
    schemas: HashMap<StepId, JSONSchema>,
    entry: Option<StepId>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("definition_id", &self.definition_id)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .finish()
    }
}

impl StepRegistry {
    /// Empty registry for `definition_id`
    pub fn new(definition_id: impl Into<DefinitionId>) -> Self {
        Self {
            definition_id: definition_id.into(),
            steps: IndexMap::new(),
            schemas: HashMap::new(),
            entry: None,
        }
    }

    /// Register a step. The first registered step is the entry step unless
    /// [`StepRegistry::set_entry`] says otherwise.
    pub fn register(&mut self, step: StepDefinition) -> Result<(), ValidationError> {
        if self.steps.contains_key(&step.id) {
            return Err(ValidationError::DuplicateStep(step.id));
        }
        if let Some(policy) = &step.retry {
            policy
                .validate()
                .map_err(|message| ValidationError::InvalidRetryPolicy {
                    step: step.id.clone(),
                    message,
                })?;
        }
        if let Some(schema) = &step.output_schema {
            let compiled =
                JSONSchema::compile(schema).map_err(|e| ValidationError::InvalidSchema {
                    step: step.id.clone(),
                    message: e.to_string(),
                })?;
            self.schemas.insert(step.id.clone(), compiled);
        }
        if self.entry.is_none() {
            self.entry = Some(step.id.clone());
        }
        self.steps.insert(step.id.clone(), step);
        Ok(())
    }

    /// Chaining form of [`StepRegistry::register`]
    pub fn with_step(mut self, step: StepDefinition) -> Result<Self, ValidationError> {
        self.register(step)?;
        Ok(self)
    }

    /// Start runs at `step` instead of the first registered step.
    pub fn set_entry(&mut self, step: impl Into<StepId>) -> Result<(), ValidationError> {
        let step = step.into();
        if !self.steps.contains_key(&step) {
            return Err(ValidationError::UnknownStep(step));
        }
        self.entry = Some(step);
        Ok(())
    }

    /// Definition this registry describes
    #[inline]
    #[must_use]
    pub fn definition_id(&self) -> &DefinitionId {
        &self.definition_id
    }

    /// Step every run starts at
    #[inline]
    #[must_use]
    pub fn entry(&self) -> Option<&StepId> {
        self.entry.as_ref()
    }

    /// Look up a step by id
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    /// Steps in declaration order
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values()
    }

    /// Number of registered steps
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// No steps registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fresh per-run records, one per declared step, in declaration order
    #[must_use]
    pub fn step_records(&self) -> Vec<StepRecord> {
        self.steps
            .values()
            .map(|s| StepRecord::new(s.id.clone(), s.name.clone()))
            .collect()
    }

    /// Resolve the target following `step_id` for the given run state.
    ///
    /// Guarded edges are tried in declaration order; the first unguarded edge
    /// is the default. A step with no edges ends the workflow.
    pub fn edges_from(&self, step_id: &str, run: &WorkflowRun) -> Result<EdgeTarget, EngineError> {
        let step = self
            .steps
            .get(step_id)
            .ok_or_else(|| ValidationError::UnknownStep(step_id.into()))?;

        if step.edges.is_empty() {
            return Ok(EdgeTarget::End);
        }

        let guarded = step
            .edges
            .iter()
            .filter_map(|e| e.guard.as_ref().map(|g| (e, g)))
            .find(|(_, guard)| guard.evaluate(run));
        if let Some((edge, guard)) = guarded {
            tracing::debug!(step = %step_id, ?guard, target = ?edge.to, "guarded edge matched");
            return Ok(edge.to.clone());
        }

        step.edges
            .iter()
            .find(|e| e.guard.is_none())
            .map(|e| e.to.clone())
            .ok_or_else(|| EngineError::NoMatchingEdge {
                step: step.id.clone(),
            })
    }

    /// Whether runs always pause at `step_id`
    #[must_use]
    pub fn is_interrupt_point(&self, step_id: &str) -> bool {
        self.interrupt_mode(step_id).is_some()
    }

    /// Static pause mode of `step_id`, if any
    #[must_use]
    pub fn interrupt_mode(&self, step_id: &str) -> Option<InterruptMode> {
        self.steps.get(step_id).and_then(StepDefinition::interrupt_mode)
    }

    /// Declared interrupt points, used to seed new runs
    #[must_use]
    pub fn interrupt_points(&self) -> BTreeSet<StepId> {
        self.steps
            .values()
            .filter(|s| s.interrupt_mode().is_some())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Check a result payload against the step's output schema, if any.
    pub fn check_output(&self, step_id: &str, payload: &Value) -> Result<(), StepError> {
        let Some(schema) = self.schemas.get(step_id) else {
            return Ok(());
        };
        if let Err(errors) = schema.validate(payload) {
            let details: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(StepError::invalid_output(details.join("; ")));
        }
        Ok(())
    }

    /// Validate the declared graph as a whole.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let entry = self.entry.as_ref().ok_or(ValidationError::EmptyDefinition)?;

        let end = self.steps.len();
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        graph.add_node(end);
        for (index, step) in self.steps.values().enumerate() {
            graph.add_node(index);
            if step.edges.is_empty() {
                graph.add_edge(index, end, ());
            }
            for edge in &step.edges {
                let target = match &edge.to {
                    EdgeTarget::End => end,
                    EdgeTarget::Step(to) => {
                        self.steps
                            .get_index_of(to)
                            .ok_or_else(|| ValidationError::UnknownTarget {
                                from: step.id.clone(),
                                to: to.clone(),
                            })?
                    }
                };
                graph.add_edge(index, target, ());
            }
            if step.is_approval() && !self.gate_has_both_routes(step) {
                return Err(ValidationError::IncompleteGate(step.id.clone()));
            }
        }

        let start = self
            .steps
            .get_index_of(entry)
            .ok_or_else(|| ValidationError::UnknownStep(entry.clone()))?;
        let mut reached = BTreeSet::new();
        let mut dfs = Dfs::new(&graph, start);
        while let Some(node) = dfs.next(&graph) {
            reached.insert(node);
        }
        if let Some(index) = (0..end).find(|index| !reached.contains(index)) {
            let id = self.steps.get_index(index).map(|(id, _)| id.clone());
            return Err(ValidationError::Unreachable(id.unwrap_or_else(|| entry.clone())));
        }
        if !reached.contains(&end) {
            return Err(ValidationError::NoTerminal);
        }

        // every cycle must pass a human gate, otherwise a run can loop forever
        let mut unattended = graph.clone();
        unattended.remove_node(end);
        for (index, step) in self.steps.values().enumerate() {
            if step.is_approval() {
                unattended.remove_node(index);
            }
        }
        for component in tarjan_scc(&unattended) {
            let looping = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| unattended.contains_edge(n, n));
            if looping {
                let mut ids: Vec<StepId> = component
                    .iter()
                    .filter_map(|&i| self.steps.get_index(i).map(|(id, _)| id.clone()))
                    .collect();
                ids.sort();
                return Err(ValidationError::UnattendedCycle(ids));
            }
        }

        Ok(())
    }

    fn gate_has_both_routes(&self, gate: &StepDefinition) -> bool {
        let routes = |wanted: ApprovalDecision| {
            gate.edges.iter().any(|e| match &e.guard {
                None => true,
                Some(Guard::Approved(step)) => {
                    step == &gate.id && wanted == ApprovalDecision::Approve
                }
                Some(Guard::Rejected(step)) => step == &gate.id && wanted == ApprovalDecision::Reject,
                Some(_) => false,
            })
        };
        gate.edges.is_empty()
            || (routes(ApprovalDecision::Approve) && routes(ApprovalDecision::Reject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalRecord;
    use crate::unit::unit_fn;
    use chrono::Utc;
    use serde_json::json;

    fn noop() -> Arc<dyn StepUnit> {
        unit_fn(|_ctx| async { Ok(json!({})) })
    }

    fn run_for(registry: &StepRegistry) -> WorkflowRun {
        WorkflowRun::new(
            registry.definition_id().clone(),
            registry.step_records(),
            registry.interrupt_points(),
            json!({}),
        )
    }

    fn review_registry() -> StepRegistry {
        StepRegistry::new("campaign")
            .with_step(StepDefinition::task("draft", noop()).then("review"))
            .unwrap()
            .with_step(
                StepDefinition::approval("review")
                    .on_approve("publish")
                    .on_reject("draft"),
            )
            .unwrap()
            .with_step(StepDefinition::task("publish", noop()).finish())
            .unwrap()
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let mut registry = StepRegistry::new("d");
        registry.register(StepDefinition::task("a", noop())).unwrap();
        let err = registry.register(StepDefinition::task("a", noop())).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateStep("a".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn first_registered_step_is_entry() {
        let registry = review_registry();
        assert_eq!(registry.entry(), Some(&StepId::from("draft")));
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn guarded_edges_win_over_default_in_order() {
        let registry = StepRegistry::new("d")
            .with_step(
                StepDefinition::task("score", noop())
                    .then("fallback")
                    .then_when(Guard::result_equals("score", "/grade", json!("A")), "fast")
                    .then_when(Guard::custom("always", |_| true), "slow"),
            )
            .unwrap()
            .with_step(StepDefinition::task("fast", noop()))
            .unwrap()
            .with_step(StepDefinition::task("slow", noop()))
            .unwrap()
            .with_step(StepDefinition::task("fallback", noop()))
            .unwrap();

        let mut run = run_for(&registry);
        assert_eq!(registry.edges_from("score", &run).unwrap(), EdgeTarget::from("slow"));

        run.results.insert("score".into(), json!({ "grade": "A" }));
        assert_eq!(registry.edges_from("score", &run).unwrap(), EdgeTarget::from("fast"));
    }

    #[test]
    fn default_edge_used_when_no_guard_matches() {
        let registry = review_registry();
        let run = run_for(&registry);
        assert_eq!(registry.edges_from("draft", &run).unwrap(), EdgeTarget::from("review"));
        assert_eq!(registry.edges_from("publish", &run).unwrap(), EdgeTarget::End);
    }

    #[test]
    fn gate_without_decision_has_no_matching_edge() {
        let registry = review_registry();
        let mut run = run_for(&registry);
        let err = registry.edges_from("review", &run).unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingEdge { step } if step.as_str() == "review"));

        run.decisions.insert(
            "review".into(),
            ApprovalRecord {
                decision: ApprovalDecision::Reject,
                note: None,
                decided_at: Utc::now(),
            },
        );
        assert_eq!(registry.edges_from("review", &run).unwrap(), EdgeTarget::from("draft"));
    }

    #[test]
    fn interrupt_points_include_gates_and_flagged_steps() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::task("a", noop()).then("b"))
            .unwrap()
            .with_step(StepDefinition::task("b", noop()).pause_after().finish())
            .unwrap();
        assert!(!registry.is_interrupt_point("a"));
        assert_eq!(registry.interrupt_mode("b"), Some(InterruptMode::After));

        let gates = review_registry();
        assert!(gates.is_interrupt_point("review"));
        assert_eq!(
            gates.interrupt_points().into_iter().collect::<Vec<_>>(),
            vec![StepId::from("review")]
        );
    }

    #[test]
    fn validate_reports_unknown_target() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::task("a", noop()).then("ghost"))
            .unwrap();
        assert_eq!(
            registry.validate().unwrap_err(),
            ValidationError::UnknownTarget {
                from: "a".into(),
                to: "ghost".into()
            }
        );
    }

    #[test]
    fn validate_reports_unreachable_step() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::task("a", noop()).finish())
            .unwrap()
            .with_step(StepDefinition::task("island", noop()))
            .unwrap();
        assert_eq!(
            registry.validate().unwrap_err(),
            ValidationError::Unreachable("island".into())
        );
    }

    #[test]
    fn validate_rejects_loops_without_gate() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::task("a", noop()).then("b"))
            .unwrap()
            .with_step(
                StepDefinition::task("b", noop())
                    .then_when(Guard::custom("again", |_| true), "a")
                    .finish(),
            )
            .unwrap();
        assert_eq!(
            registry.validate().unwrap_err(),
            ValidationError::UnattendedCycle(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn validate_requires_gate_routes() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::approval("review").on_approve(EdgeTarget::End))
            .unwrap();
        assert_eq!(
            registry.validate().unwrap_err(),
            ValidationError::IncompleteGate("review".into())
        );
    }

    #[test]
    fn validate_requires_reachable_end() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::approval("review").on_approve("review").on_reject("review"))
            .unwrap();
        assert_eq!(registry.validate().unwrap_err(), ValidationError::NoTerminal);
    }

    #[test]
    fn empty_registry_is_invalid() {
        assert_eq!(
            StepRegistry::new("d").validate().unwrap_err(),
            ValidationError::EmptyDefinition
        );
    }

    #[test]
    fn output_schema_is_enforced() {
        let registry = StepRegistry::new("d")
            .with_step(StepDefinition::task("brief", noop()).with_output_schema(json!({
                "type": "object",
                "required": ["headline"],
                "properties": { "headline": { "type": "string" } }
            })))
            .unwrap();

        assert!(registry.check_output("brief", &json!({ "headline": "Go" })).is_ok());
        let err = registry.check_output("brief", &json!({ "body": 1 })).unwrap_err();
        assert_eq!(err.kind, crate::error::StepErrorKind::InvalidOutput);
    }

    #[test]
    fn broken_schema_fails_registration() {
        let err = StepRegistry::new("d")
            .with_step(
                StepDefinition::task("brief", noop())
                    .with_output_schema(json!({ "type": "no-such-type" })),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchema { .. }));
    }
}
