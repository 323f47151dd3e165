use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    error::{GraphError, Result},
    session::Session,
    task::{NextAction, Task, TaskResult},
};

/// Default bound on the number of tasks one `execute_session` call may run.
pub const DEFAULT_MAX_STEPS: usize = 32;

/// Edge between tasks in the graph
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// An immutable graph of tasks. Build it once with [`GraphBuilder`] and share it
/// across requests; all per-request state lives in the [`Session`].
pub struct Graph {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl Graph {
    /// Run the session from its current task until a task ends the pipeline or
    /// hands control back with [`NextAction::Continue`].
    ///
    /// Any task error aborts the run immediately; the session keeps the trail of
    /// the tasks that did run so the caller can see where it stopped.
    pub async fn execute_session(&self, session: &mut Session) -> Result<ExecutionResult> {
        let mut steps = 0usize;

        loop {
            if steps >= self.max_steps {
                return Err(GraphError::StepLimitExceeded(self.max_steps));
            }
            steps += 1;

            let task_id = session.current_task_id.clone();
            session.trail.push(task_id.clone());

            let result = self.execute_single_task(&task_id, session).await?;
            session.status_message = result.status_message.clone();

            match &result.next_action {
                NextAction::ContinueAndExecute => match self.find_next_task(&result.task_id) {
                    Some(next_task_id) => session.current_task_id = next_task_id,
                    None => {
                        return Ok(ExecutionResult {
                            response: result.response,
                            status: ExecutionStatus::Completed,
                        });
                    }
                },
                NextAction::GoTo(target_id) => {
                    if !self.tasks.contains_key(target_id) {
                        return Err(GraphError::TaskNotFound(target_id.clone()));
                    }
                    session.current_task_id = target_id.clone();
                }
                NextAction::Continue => {
                    if let Some(next_task_id) = self.find_next_task(&result.task_id) {
                        session.current_task_id = next_task_id;
                    }
                    return Ok(ExecutionResult {
                        response: result.response,
                        status: ExecutionStatus::WaitingForInput,
                    });
                }
                NextAction::End => {
                    info!(
                        graph_id = %self.id,
                        session_id = %session.id,
                        steps = steps,
                        "Graph execution completed"
                    );
                    return Ok(ExecutionResult {
                        response: result.response,
                        status: ExecutionStatus::Completed,
                    });
                }
            }
        }
    }

    async fn execute_single_task(&self, task_id: &str, session: &Session) -> Result<TaskResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;

        debug!(graph_id = %self.id, session_id = %session.id, task_id = %task_id, "Running task");

        let mut result = task.run(session.context.clone()).await?;
        result.task_id = task_id.to_string();

        Ok(result)
    }

    /// Find the task that follows `current_task_id`
    pub fn find_next_task(&self, current_task_id: &str) -> Option<String> {
        self.edges
            .iter()
            .find(|edge| edge.from == current_task_id)
            .map(|edge| edge.to.clone())
    }

    pub fn start_task_id(&self) -> Option<&str> {
        self.start_task_id.as_deref()
    }

    /// Start task id, or an error when the graph is empty
    pub fn require_start_task(&self) -> Result<&str> {
        self.start_task_id()
            .ok_or_else(|| GraphError::NoStartTask(self.id.clone()))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            edges: Vec::new(),
            start_task_id: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Add a task. The first task added becomes the start task.
    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        let task_id = task.id().to_string();
        if self.start_task_id.is_none() {
            self.start_task_id = Some(task_id.clone());
        }
        self.tasks.insert(task_id, task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Ignored when no task with this id has been added.
    pub fn set_start_task(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if self.tasks.contains_key(&task_id) {
            self.start_task_id = Some(task_id);
        }
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Graph {
        Graph {
            id: self.id,
            tasks: self.tasks,
            edges: self.edges,
            start_task_id: self.start_task_id,
            max_steps: self.max_steps,
        }
    }
}

/// Status of graph execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// A task handed control back before the pipeline finished
    WaitingForInput,
    /// The pipeline ran to completion
    Completed,
}
