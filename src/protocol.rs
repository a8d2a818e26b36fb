use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAssistantRequest {
    #[serde(alias = "conversationId", alias = "conversation_id")]
    pub thread_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadFileRequest {
    #[serde(alias = "fileName")]
    pub file_name: String,
    #[serde(alias = "fileBase64")]
    pub file_base64: String,
}

/// Structured payload of the terminal error fragment sent when a run fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFault {
    pub code: String,
    pub message: String,
}

impl RunFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RunFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// One unit of output destined for the client stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fragment {
    Content { content: String },
    Fault { error: RunFault },
}

impl Fragment {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Fragment::Content { content } => Some(content),
            Fragment::Fault { .. } => None,
        }
    }
}

/// How fragments are written onto the HTTP body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Framing {
    /// `data: {json}` followed by a blank line.
    #[default]
    Sse,
    /// Fragment text as-is.
    Raw,
}

impl Framing {
    pub fn encode(self, fragment: &Fragment) -> String {
        match self {
            Framing::Sse => {
                let data = serde_json::to_string(fragment).unwrap_or_default();
                format!("data: {}\n\n", data)
            }
            Framing::Raw => match fragment {
                Fragment::Content { content } => content.clone(),
                Fragment::Fault { error } => format!("\n[error] {}\n", error),
            },
        }
    }
}
