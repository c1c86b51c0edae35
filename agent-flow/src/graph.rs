use dashmap::DashMap;
use std::sync::{Arc, Mutex};

use crate::{
    context::Context,
    error::{GraphError, Result},
    task::{NextAction, Task},
};

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Edge between tasks in the graph
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

const DEFAULT_MAX_STEPS: usize = 64;

/// A graph of tasks driven to completion in a single execution.
///
/// Unlike a step-per-request workflow engine, `execute` follows edges until a
/// task returns [`NextAction::End`] (or no outgoing edge matches), carrying
/// the most recent task response along. Cycles are allowed; the per-execution
/// step limit is the safety net against unbounded loops.
pub struct Graph {
    pub id: String,
    tasks: DashMap<String, Arc<dyn Task>>,
    edges: Mutex<Vec<Edge>>,
    start_task_id: Mutex<Option<String>>,
    max_steps: usize,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: DashMap::new(),
            edges: Mutex::new(Vec::new()),
            start_task_id: Mutex::new(None),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Add a task to the graph
    pub fn add_task(&self, task: Arc<dyn Task>) -> &Self {
        let task_id = task.id().to_string();
        let is_first = self.tasks.is_empty();
        self.tasks.insert(task_id.clone(), task);

        // First task added becomes the start task unless overridden
        if is_first {
            *self.start_task_id.lock().unwrap() = Some(task_id);
        }

        self
    }

    /// Set the starting task
    pub fn set_start_task(&self, task_id: impl Into<String>) -> &Self {
        let task_id = task_id.into();
        if self.tasks.contains_key(&task_id) {
            *self.start_task_id.lock().unwrap() = Some(task_id);
        }
        self
    }

    /// Add an unconditional edge between tasks
    pub fn add_edge(&self, from: impl Into<String>, to: impl Into<String>) -> &Self {
        self.edges.lock().unwrap().push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Add a conditional edge between tasks.
    ///
    /// Edges out of a task are evaluated in insertion order; the first whose
    /// condition holds (unconditional edges always hold) is taken.
    pub fn add_conditional_edge<F>(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> &Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.edges.lock().unwrap().push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    /// Execute the graph from its start task until a task ends the run.
    ///
    /// Returns the last non-empty response produced by any task.
    pub async fn execute(&self, context: Context) -> Result<Option<String>> {
        let start = self
            .start_task_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GraphError::TaskNotFound("<start>".to_string()))?;
        self.execute_from(&start, context).await
    }

    /// Execute the graph starting from a specific task
    pub async fn execute_from(
        &self,
        start_task_id: &str,
        context: Context,
    ) -> Result<Option<String>> {
        let mut current = start_task_id.to_string();
        let mut last_response: Option<String> = None;

        for _ in 0..self.max_steps {
            let task = self
                .tasks
                .get(&current)
                .map(|entry| entry.clone())
                .ok_or_else(|| GraphError::TaskNotFound(current.clone()))?;

            let result = task.run(context.clone()).await?;

            if result.response.is_some() {
                last_response = result.response;
            }

            match result.next_action {
                NextAction::End => return Ok(last_response),
                NextAction::GoTo(target_id) => {
                    if !self.tasks.contains_key(&target_id) {
                        return Err(GraphError::TaskNotFound(target_id));
                    }
                    current = target_id;
                }
                NextAction::Continue => match self.find_next_task(&current, &context) {
                    Some(next_id) => current = next_id,
                    None => return Ok(last_response),
                },
            }
        }

        Err(GraphError::StepLimitExceeded(self.max_steps))
    }

    /// Find the next task based on edges and conditions
    pub fn find_next_task(&self, current_task_id: &str, context: &Context) -> Option<String> {
        let edges = self.edges.lock().unwrap();

        for edge in edges.iter() {
            if edge.from == current_task_id {
                match &edge.condition {
                    Some(condition) if !condition(context) => continue,
                    _ => return Some(edge.to.clone()),
                }
            }
        }
        None
    }

    /// Get the start task ID
    pub fn start_task_id(&self) -> Option<String> {
        self.start_task_id.lock().unwrap().clone()
    }

    /// Get a task by ID
    pub fn get_task(&self, task_id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task_id).map(|entry| entry.clone())
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(id),
        }
    }

    pub fn add_task(self, task: Arc<dyn Task>) -> Self {
        self.graph.add_task(task);
        self
    }

    pub fn add_edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.add_edge(from, to);
        self
    }

    pub fn add_conditional_edge<F>(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.graph.add_conditional_edge(from, to, condition);
        self
    }

    pub fn set_start_task(self, task_id: impl Into<String>) -> Self {
        self.graph.set_start_task(task_id);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.graph.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}
