//! In-memory dependency graph over task ids, with cycle detection and topological
//! ordering.
//!
//! Grounded on `workers/schedulers/dependency_scheduler.py::DependencyScheduler`: Kahn's
//! algorithm for `execution_order`, a DFS over a hypothetical graph (including the
//! candidate edge) before `add_dependency` mutates anything, and an in-flight execution
//! map paired with a bounded history list. `_evaluate_condition`'s always-true stub is
//! replaced here by an injected `ConditionEvaluator` so `conditional` dependencies are
//! actually pluggable rather than permanently vacuous.

use chrono::{DateTime, Utc};
use scheduler_core::SchedulerError;
use std::collections::{HashMap, HashSet, VecDeque};

pub use scheduler_core::model::{DependencyType, ExecutionStatus, TaskDependency};

/// A single recorded execution attempt, moved from `in_flight` to `history` on
/// completion.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Evaluates a `conditional` dependency's free-text condition against the current
/// execution state. The default implementation always returns `true`, matching the
/// teacher's stub; callers that need real condition logic supply their own.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, dep_task_id: &str) -> bool;
}

pub struct AlwaysTrueCondition;

impl ConditionEvaluator for AlwaysTrueCondition {
    fn evaluate(&self, _condition: &str, _dep_task_id: &str) -> bool {
        true
    }
}

const DEFAULT_MAX_HISTORY: usize = 10_000;

pub struct DependencyScheduler {
    dependencies: HashMap<String, TaskDependency>,
    /// adjacency: dep_task_id -> [task_id that depends on it]
    graph: HashMap<String, Vec<String>>,
    statuses: HashMap<String, ExecutionStatus>,
    in_flight: HashMap<String, TaskExecution>,
    history: VecDeque<TaskExecution>,
    condition_evaluator: Box<dyn ConditionEvaluator>,
    max_history: usize,
}

impl Default for DependencyScheduler {
    fn default() -> Self {
        Self::new(Box::new(AlwaysTrueCondition))
    }
}

impl DependencyScheduler {
    pub fn new(condition_evaluator: Box<dyn ConditionEvaluator>) -> Self {
        DependencyScheduler {
            dependencies: HashMap::new(),
            graph: HashMap::new(),
            statuses: HashMap::new(),
            in_flight: HashMap::new(),
            history: VecDeque::new(),
            condition_evaluator,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Registers a dependency, rejecting it with `CycleDetected` without mutating any
    /// state if adding the implied edges would create a cycle.
    pub fn add_dependency(&mut self, dep: TaskDependency) -> Result<(), SchedulerError> {
        if dep.task_id.trim().is_empty() {
            return Err(SchedulerError::InvalidSpec("task_id must not be blank".into()));
        }
        if dep.depends_on.is_empty() {
            return Err(SchedulerError::InvalidSpec(
                "depends_on must name at least one task".into(),
            ));
        }

        if self.would_create_cycle(&dep.task_id, &dep.depends_on) {
            return Err(SchedulerError::CycleDetected);
        }

        for parent in &dep.depends_on {
            self.graph
                .entry(parent.clone())
                .or_default()
                .push(dep.task_id.clone());
            self.statuses.entry(parent.clone()).or_insert(ExecutionStatus::Pending);
        }
        self.statuses
            .entry(dep.task_id.clone())
            .or_insert(ExecutionStatus::Pending);
        self.dependencies.insert(dep.task_id.clone(), dep);
        Ok(())
    }

    pub fn remove_dependency(&mut self, task_id: &str) {
        if let Some(dep) = self.dependencies.remove(task_id) {
            for parent in &dep.depends_on {
                if let Some(children) = self.graph.get_mut(parent) {
                    children.retain(|c| c != task_id);
                }
            }
        }
    }

    /// DFS over the graph plus the hypothetical new edges `task_id <- depends_on`,
    /// looking for a path back from any of `depends_on` to `task_id`.
    fn would_create_cycle(&self, task_id: &str, depends_on: &[String]) -> bool {
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        for (parent, children) in &self.graph {
            graph
                .entry(parent.as_str())
                .or_default()
                .extend(children.iter().map(|s| s.as_str()));
        }
        for parent in depends_on {
            graph.entry(parent.as_str()).or_default().push(task_id);
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        for node in graph.keys().cloned().collect::<Vec<_>>() {
            if !visited.contains(node) && Self::dfs_has_cycle(&graph, node, &mut visited, &mut rec_stack) {
                return true;
            }
        }
        false
    }

    fn dfs_has_cycle<'a>(
        graph: &HashMap<&'a str, Vec<&'a str>>,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);
        if let Some(children) = graph.get(node) {
            for &child in children {
                if !visited.contains(child) {
                    if Self::dfs_has_cycle(graph, child, visited, rec_stack) {
                        return true;
                    }
                } else if rec_stack.contains(child) {
                    return true;
                }
            }
        }
        rec_stack.remove(node);
        false
    }

    /// True iff every declared dependency of `task_id` is satisfied according to its
    /// `dependency_type`.
    pub fn can_execute(&self, task_id: &str) -> bool {
        if matches!(
            self.statuses.get(task_id),
            Some(ExecutionStatus::Running) | Some(ExecutionStatus::Completed)
        ) {
            return false;
        }
        let Some(dep) = self.dependencies.get(task_id) else {
            return true;
        };
        self.is_dependency_satisfied(dep)
    }

    fn is_dependency_satisfied(&self, dep: &TaskDependency) -> bool {
        let status_of = |id: &str| {
            self.statuses
                .get(id)
                .copied()
                .unwrap_or(ExecutionStatus::Pending)
        };
        match dep.dependency_type {
            DependencyType::Requires => dep
                .depends_on
                .iter()
                .all(|id| status_of(id) == ExecutionStatus::Completed),
            DependencyType::Optional => dep.depends_on.iter().all(|id| {
                matches!(
                    status_of(id),
                    ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped
                )
            }),
            DependencyType::RequiresAny => dep
                .depends_on
                .iter()
                .any(|id| status_of(id) == ExecutionStatus::Completed),
            DependencyType::Conditional => {
                let completed = dep
                    .depends_on
                    .iter()
                    .all(|id| status_of(id) == ExecutionStatus::Completed);
                completed
                    && dep.depends_on.iter().all(|id| {
                        dep.condition
                            .as_deref()
                            .map(|c| self.condition_evaluator.evaluate(c, id))
                            .unwrap_or(true)
                    })
            }
        }
    }

    pub fn ready_tasks(&self) -> Vec<String> {
        self.statuses
            .keys()
            .filter(|id| {
                self.statuses.get(*id) == Some(&ExecutionStatus::Pending) && self.can_execute(id)
            })
            .cloned()
            .collect()
    }

    /// Deterministic Kahn topological sort. An empty result for a non-empty graph
    /// indicates a cycle slipped past `add_dependency` (should not happen).
    pub fn execution_order(&self) -> Vec<String> {
        let mut nodes: HashSet<&str> = HashSet::new();
        for (parent, children) in &self.graph {
            nodes.insert(parent.as_str());
            for child in children {
                nodes.insert(child.as_str());
            }
        }
        let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|&n| (n, 0)).collect();
        for children in self.graph.values() {
            for child in children {
                *in_degree.entry(child.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = {
            let mut zero: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&n, _)| n)
                .collect();
            zero.sort();
            zero.into()
        };

        let mut order = Vec::new();
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            if let Some(children) = self.graph.get(node) {
                let mut newly_ready = Vec::new();
                for child in children {
                    if let Some(deg) = in_degree.get_mut(child.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            newly_ready.push(child.as_str());
                        }
                    }
                }
                newly_ready.sort();
                for n in newly_ready {
                    queue.push_back(n);
                }
            }
        }

        if order.len() != nodes.len() {
            return Vec::new();
        }
        order
    }

    pub fn start_task_execution(&mut self, task_id: &str) {
        self.statuses.insert(task_id.to_string(), ExecutionStatus::Running);
        self.in_flight.insert(
            task_id.to_string(),
            TaskExecution {
                task_id: task_id.to_string(),
                status: ExecutionStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );
    }

    pub fn complete_task_execution(&mut self, task_id: &str, status: ExecutionStatus, error: Option<String>) {
        self.statuses.insert(task_id.to_string(), status);
        if let Some(mut execution) = self.in_flight.remove(task_id) {
            execution.status = status;
            execution.completed_at = Some(Utc::now());
            execution.error = error;
            if self.history.len() >= self.max_history {
                self.history.pop_front();
            }
            self.history.push_back(execution);
        }
    }

    pub fn task_status(&self, task_id: &str) -> ExecutionStatus {
        self.statuses.get(task_id).copied().unwrap_or(ExecutionStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(task_id: &str, depends_on: &[&str], kind: DependencyType) -> TaskDependency {
        TaskDependency {
            task_id: task_id.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            dependency_type: kind,
            condition: None,
            retry_on_failure: false,
            max_retries: 0,
        }
    }

    #[test]
    fn detects_a_direct_cycle_without_mutating_state() {
        let mut scheduler = DependencyScheduler::default();
        scheduler
            .add_dependency(dep("b", &["a"], DependencyType::Requires))
            .unwrap();
        let err = scheduler
            .add_dependency(dep("a", &["b"], DependencyType::Requires))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected));
        assert_eq!(scheduler.execution_order(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn execution_order_is_a_valid_topological_sort() {
        let mut scheduler = DependencyScheduler::default();
        scheduler.add_dependency(dep("b", &["a"], DependencyType::Requires)).unwrap();
        scheduler.add_dependency(dep("c", &["b"], DependencyType::Requires)).unwrap();
        let order = scheduler.execution_order();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn requires_any_is_satisfied_by_a_single_completion() {
        let mut scheduler = DependencyScheduler::default();
        scheduler
            .add_dependency(dep("c", &["a", "b"], DependencyType::RequiresAny))
            .unwrap();
        assert!(!scheduler.can_execute("c"));
        scheduler.complete_task_execution("a", ExecutionStatus::Completed, None);
        assert!(scheduler.can_execute("c"));
    }

    #[test]
    fn optional_dependency_tolerates_failure() {
        let mut scheduler = DependencyScheduler::default();
        scheduler
            .add_dependency(dep("b", &["a"], DependencyType::Optional))
            .unwrap();
        scheduler.complete_task_execution("a", ExecutionStatus::Failed, Some("boom".into()));
        assert!(scheduler.can_execute("b"));
    }

    #[test]
    fn running_or_completed_task_cannot_be_reentered() {
        let mut scheduler = DependencyScheduler::default();
        scheduler.start_task_execution("a");
        assert!(!scheduler.can_execute("a"));
    }
}
