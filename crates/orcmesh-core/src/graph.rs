//! Task Graph: task storage, dependency/dependent indices, cycle detection,
//! readiness queries, and cascade propagation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::OrchestratorError;
use crate::types::{CascadePolicy, Task, TaskId, TaskStatus};

/// Owns every task and the reverse (dependent) index built from their
/// forward `dependencies` lists.
#[derive(Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn direct_dependents(&self, id: &str) -> impl Iterator<Item = &TaskId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Insert a new task, rejecting it if it would introduce a dependency
    /// cycle or self-dependency.
    ///
    /// Detection strategy: walk the transitive dependency closure of every
    /// id in `task.dependencies`; if that closure ever reaches `task.id`,
    /// inserting would close a cycle back to the new task.
    pub fn insert(&mut self, task: Task) -> Result<(), OrchestratorError> {
        if task.dependencies.iter().any(|d| d == &task.id) {
            return Err(OrchestratorError::InvalidGraph(format!(
                "task {} depends on itself",
                task.id
            )));
        }

        for dep in &task.dependencies {
            if !self.tasks.contains_key(dep) {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                )));
            }
            if self.transitively_depends_on(dep, &task.id) {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "submitting task {} would create a dependency cycle through {}",
                    task.id, dep
                )));
            }
        }

        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Whether `start`'s transitive dependency closure includes `target`.
    fn transitively_depends_on(&self, start: &str, target: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(task) = self.tasks.get(current) {
                for dep in &task.dependencies {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    /// Whether every dependency of `id` is in a successful terminal state.
    pub fn is_ready(&self, id: &str) -> bool {
        match self.tasks.get(id) {
            Some(task) => task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .map(|d| d.status.is_success() || d.status == TaskStatus::Skipped)
                    .unwrap_or(false)
            }),
            None => false,
        }
    }

    /// All task ids currently in a non-terminal state whose dependencies
    /// are now fully satisfied but whose status is still `Waiting`.
    pub fn newly_ready(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Waiting && self.is_ready(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Apply `task_id`'s failure to its not-yet-started descendants per
    /// `policy`. Returns the ids that transitioned as a result, for event
    /// emission by the caller.
    pub fn cascade(&mut self, task_id: &str, policy: CascadePolicy) -> Vec<TaskId> {
        let mut affected = Vec::new();
        let mut queue: VecDeque<TaskId> = self
            .dependents
            .get(task_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut visited: HashSet<TaskId> = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }

            match policy {
                CascadePolicy::Abort => {
                    task.status = TaskStatus::CascadeFailed;
                    task.ended_at = Some(chrono::Utc::now());
                    affected.push(id.clone());
                    if let Some(next) = self.dependents.get(&id) {
                        queue.extend(next.iter().cloned());
                    }
                }
                CascadePolicy::Skip => {
                    task.status = TaskStatus::Skipped;
                    task.ended_at = Some(chrono::Utc::now());
                    affected.push(id.clone());
                    // Skipped counts as "satisfied" for readiness purposes
                    // (see is_ready), so dependents are re-evaluated by the
                    // Scheduler's normal dependency-resolution pass rather
                    // than force-cascaded here.
                }
                CascadePolicy::Continue => {
                    task.dependency_failed = true;
                }
            }
        }

        affected
    }

    pub fn values(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    /// Remove a terminal task that has no undelivered dependents. Returns
    /// `true` if removed.
    pub fn try_prune(&mut self, id: &str) -> bool {
        let removable = match self.tasks.get(id) {
            Some(task) => task.status.is_terminal() && task.result_delivered,
            None => return false,
        };
        if !removable {
            return false;
        }
        let has_pending_dependents = self
            .dependents
            .get(id)
            .map(|set| {
                set.iter()
                    .any(|dep_id| self.tasks.get(dep_id).is_some_and(|t| !t.status.is_terminal()))
            })
            .unwrap_or(false);
        if has_pending_dependents {
            return false;
        }
        self.tasks.remove(id);
        self.dependents.remove(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskType};

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, TaskType::Analyze, TaskPriority::Medium);
        t.id = id.to_string();
        t.dependencies = deps.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn insert_rejects_self_dependency() {
        let mut graph = TaskGraph::new();
        let err = graph.insert(task("a", &["a"])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidGraph(_)));
    }

    #[test]
    fn insert_rejects_unknown_dependency() {
        let mut graph = TaskGraph::new();
        let err = graph.insert(task("a", &["ghost"])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidGraph(_)));
    }

    #[test]
    fn insert_rejects_cycle_through_dependency_closure() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[])).unwrap();
        graph.insert(task("b", &["a"])).unwrap();

        // A task with id "a" that depends on "b" would close a -> b -> a,
        // since "b" already transitively depends on the existing "a".
        let err = graph.insert(task("a", &["b"])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidGraph(_)));
    }

    #[test]
    fn is_ready_true_only_when_all_deps_completed() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[])).unwrap();
        graph.insert(task("b", &["a"])).unwrap();

        assert!(!graph.is_ready("b"));
        graph.get_mut("a").unwrap().status = TaskStatus::Completed;
        assert!(graph.is_ready("b"));
    }

    #[test]
    fn cascade_abort_marks_descendants_cascade_failed() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[])).unwrap();
        graph.insert(task("b", &["a"])).unwrap();
        graph.insert(task("c", &["b"])).unwrap();

        graph.get_mut("a").unwrap().status = TaskStatus::Failed;
        let affected = graph.cascade("a", CascadePolicy::Abort);

        assert_eq!(affected.len(), 2);
        assert_eq!(graph.get("b").unwrap().status, TaskStatus::CascadeFailed);
        assert_eq!(graph.get("c").unwrap().status, TaskStatus::CascadeFailed);
    }

    #[test]
    fn cascade_continue_marks_dependency_failed_flag_without_changing_status() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[])).unwrap();
        graph.insert(task("b", &["a"])).unwrap();

        graph.get_mut("a").unwrap().status = TaskStatus::Failed;
        graph.cascade("a", CascadePolicy::Continue);

        let b = graph.get("b").unwrap();
        assert!(b.dependency_failed);
        assert_eq!(b.status, TaskStatus::Waiting);
    }

    #[test]
    fn cascade_skip_marks_skipped_and_stops_without_forcing_children() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[])).unwrap();
        graph.insert(task("b", &["a"])).unwrap();
        graph.insert(task("c", &["b"])).unwrap();

        graph.get_mut("a").unwrap().status = TaskStatus::Failed;
        graph.cascade("a", CascadePolicy::Skip);

        assert_eq!(graph.get("b").unwrap().status, TaskStatus::Skipped);
        // c's status is untouched by cascade itself; is_ready() treats
        // Skipped as satisfied so the Scheduler can still progress it.
        assert_eq!(graph.get("c").unwrap().status, TaskStatus::Waiting);
        assert!(graph.is_ready("c"));
    }

    #[test]
    fn try_prune_requires_terminal_delivered_and_no_pending_dependents() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[])).unwrap();
        assert!(!graph.try_prune("a"));

        let a = graph.get_mut("a").unwrap();
        a.status = TaskStatus::Completed;
        a.result_delivered = true;
        assert!(graph.try_prune("a"));
        assert!(!graph.contains("a"));
    }
}
