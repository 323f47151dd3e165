use serde::{Deserialize, Serialize};

use crate::context::Context;

/// State of one pass through a graph.
///
/// A session is created per request and dropped once the request is answered, so
/// nothing in it is ever visible to another request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub graph_id: String,
    pub current_task_id: String,
    pub status_message: Option<String>,
    /// Ids of the tasks run so far, in execution order
    pub trail: Vec<String>,
    #[serde(skip)]
    pub context: Context,
}

impl Session {
    pub fn new_from_task(sid: String, task_name: &str) -> Self {
        Self {
            id: sid,
            graph_id: "default".to_string(),
            current_task_id: task_name.to_string(),
            status_message: None,
            trail: Vec::new(),
            context: Context::new(),
        }
    }

    pub fn with_graph_id(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = graph_id.into();
        self
    }
}
