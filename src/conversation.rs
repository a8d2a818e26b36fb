//! The conversation service seam: thread management, file transfer and
//! event-streamed runs. Anything implementing [`ConversationService`] can back
//! the relay.

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::pin::Pin;

use crate::error::ServiceError;

/// Author of a posted message. The relay only ever posts on behalf of the
/// user; assistant messages are produced by runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CodeInterpreter,
    FileSearch,
    Function,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Logs(String),
    Image { file_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text { value: String },
    ImageRef { file_id: String },
}

/// One event of a single run, delivered in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    RunCreated {
        run_id: String,
    },
    TextCreated,
    ToolCallCreated {
        kind: ToolKind,
    },
    ToolCallDelta {
        kind: ToolKind,
        input: Option<String>,
        outputs: Vec<ToolOutput>,
    },
    ToolCallDone {
        kind: ToolKind,
    },
    MessageCreated,
    MessageDelta {
        content: Vec<ContentPart>,
    },
    MessageDone,
}

pub type RunEventStream = Pin<Box<dyn Stream<Item = Result<RunEvent, ServiceError>> + Send>>;

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Creates a thread, attaching the given files to its code interpreter.
    async fn create_conversation(&self, file_ids: &[String]) -> Result<String, ServiceError>;

    async fn post_message(
        &self,
        thread_id: &str,
        role: Role,
        text: &str,
    ) -> Result<(), ServiceError>;

    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, ServiceError>;

    async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ServiceError>;

    /// Starts a run on the thread. The stream ends when the run is terminal;
    /// a fatal `Err` item is the last item it yields.
    async fn start_run(&self, thread_id: &str) -> Result<RunEventStream, ServiceError>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ServiceError>;
}
