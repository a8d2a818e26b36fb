use crate::conversation::{ContentPart, RunEvent, ToolKind, ToolOutput};

pub(crate) const BLOCK_OPEN: &str = "```\n";
pub(crate) const BLOCK_CLOSE: &str = "\n```\n";
pub(crate) const PARAGRAPH_BREAK: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    ToolCreated,
    ToolDelta,
    ToolDone,
    MessageCreated,
    MessageDelta,
    MessageDone,
}

/// What the state machine wants written next. Images still need their bytes
/// fetched before they become a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Text(String),
    Image { file_id: String },
}

impl Output {
    fn text(value: impl Into<String>) -> Self {
        Output::Text(value.into())
    }
}

/// Per-run render bookkeeping. `tool_call_open` is the only authority on
/// whether a close marker is owed.
#[derive(Debug, Default)]
pub struct RenderState {
    phase: Phase,
    tool_call_open: bool,
}

impl RenderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tool_call_open(&self) -> bool {
        self.tool_call_open
    }

    pub fn apply(&mut self, event: &RunEvent) -> Vec<Output> {
        let mut out = Vec::new();

        match event {
            RunEvent::RunCreated { .. } => {}
            RunEvent::TextCreated => {}
            RunEvent::ToolCallCreated { kind } => {
                self.phase = Phase::ToolCreated;
                if let Some(close) = self.close_open_block() {
                    out.push(Output::Text(close));
                }
                out.push(Output::text(intro_marker(*kind)));
                out.push(Output::text(BLOCK_OPEN));
                self.tool_call_open = true;
            }
            RunEvent::ToolCallDelta { input, outputs, .. } => {
                let input = input.as_deref().filter(|input| !input.is_empty());
                let logs: Vec<&str> = outputs
                    .iter()
                    .filter_map(|output| match output {
                        ToolOutput::Logs(logs) => Some(logs.as_str()),
                        ToolOutput::Image { .. } => None,
                    })
                    .collect();

                if input.is_none() && logs.is_empty() {
                    return out;
                }

                self.phase = Phase::ToolDelta;
                if !self.tool_call_open {
                    out.push(Output::text(BLOCK_OPEN));
                    self.tool_call_open = true;
                }
                if let Some(input) = input {
                    out.push(Output::text(input));
                }
                for logs in logs {
                    out.push(Output::Text(format!("\n{}\n", logs)));
                }
            }
            RunEvent::ToolCallDone { .. } => {
                self.phase = Phase::ToolDone;
                if let Some(close) = self.close_open_block() {
                    out.push(Output::Text(close));
                }
            }
            RunEvent::MessageCreated => self.phase = Phase::MessageCreated,
            RunEvent::MessageDelta { content } => {
                self.phase = Phase::MessageDelta;
                for part in content {
                    match part {
                        ContentPart::Text { value } if value.is_empty() => {}
                        ContentPart::Text { value } => out.push(Output::text(value.as_str())),
                        ContentPart::ImageRef { file_id } => out.push(Output::Image {
                            file_id: file_id.clone(),
                        }),
                    }
                }
            }
            RunEvent::MessageDone => {
                self.phase = Phase::MessageDone;
                out.push(Output::text(PARAGRAPH_BREAK));
            }
        }

        out
    }

    /// Returns the close marker if a block is open, marking it closed.
    pub fn close_open_block(&mut self) -> Option<String> {
        if self.tool_call_open {
            self.tool_call_open = false;
            Some(BLOCK_CLOSE.to_string())
        } else {
            None
        }
    }
}

pub(crate) fn intro_marker(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::CodeInterpreter => "<i>Launching Code Interpreter...</i>\n",
        ToolKind::FileSearch => "<i>Searching files...</i>\n",
        ToolKind::Function => "<i>Calling function...</i>\n",
        ToolKind::Unknown => "<i>Running tool...</i>\n",
    }
}
