//! Scripted [`ToolInvoker`] for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use super::client::ToolInvoker;
use super::error::WorkcellError;

/// Replies to each tool from its own queue. The last reply of a queue is
/// repeated once the queue runs dry.
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<String, VecDeque<Result<Value, WorkcellError>>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, tool: &str, reply: Result<Value, WorkcellError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(tool.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn ok(self, tool: &str, value: Value) -> Self {
        self.reply(tool, Ok(value))
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args)
            .collect()
    }
}

pub fn connection_error(operation: &str) -> WorkcellError {
    WorkcellError::Connection {
        operation: operation.to_string(),
        message: "connection reset by peer".into(),
    }
}

impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        _timeout: Duration,
    ) -> Result<Value, WorkcellError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), arguments));

        let mut replies = self.replies.lock().unwrap();
        let queue = replies
            .get_mut(tool)
            .unwrap_or_else(|| panic!("no scripted reply for {tool}"));
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}
