use serde::{Deserialize, Serialize};

use crate::conversation::{ContentPart, RunEvent, ToolKind, ToolOutput};
use crate::error::ServiceError;
use crate::protocol::RunFault;

#[derive(Debug, Deserialize)]
pub(crate) struct ObjectId {
    pub(crate) id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssistantObject {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) model: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct CreateThreadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tool_resources: Option<ToolResources>,
}

impl CreateThreadRequest {
    pub(crate) fn with_files(file_ids: &[String]) -> Self {
        if file_ids.is_empty() {
            return Self::default();
        }
        Self {
            tool_resources: Some(ToolResources {
                code_interpreter: CodeInterpreterResources {
                    file_ids: file_ids.to_vec(),
                },
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ToolResources {
    pub(crate) code_interpreter: CodeInterpreterResources,
}

#[derive(Debug, Serialize)]
pub(crate) struct CodeInterpreterResources {
    pub(crate) file_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateMessageRequest<'a> {
    pub(crate) role: &'a str,
    pub(crate) content: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRunRequest<'a> {
    pub(crate) assistant_id: &'a str,
    pub(crate) stream: bool,
}

// Streamed payloads. Only the fields the relay renders are modelled.

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    #[serde(default)]
    last_error: Option<LastError>,
}

#[derive(Debug, Deserialize)]
struct LastError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RunStepDeltaObject {
    id: String,
    delta: RunStepDelta,
}

#[derive(Debug, Deserialize)]
struct RunStepDelta {
    #[serde(default)]
    step_details: Option<StepDetailsDelta>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StepDetailsDelta {
    ToolCalls {
        #[serde(default)]
        tool_calls: Vec<ToolCallDelta>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(rename = "type")]
    kind: ToolKind,
    #[serde(default)]
    code_interpreter: Option<CodeInterpreterDelta>,
}

#[derive(Debug, Deserialize)]
struct CodeInterpreterDelta {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    outputs: Vec<CodeInterpreterOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodeInterpreterOutput {
    Logs {
        #[serde(default)]
        logs: String,
    },
    Image {
        image: FileRef,
    },
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct RunStepObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaObject {
    delta: MessageDelta,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: Vec<MessageContentDelta>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContentDelta {
    Text {
        index: usize,
        #[serde(default)]
        text: Option<TextDelta>,
    },
    ImageFile {
        image_file: FileRef,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenToolCall {
    step_id: String,
    index: usize,
    kind: ToolKind,
}

pub(crate) type DecodedEvent = Result<RunEvent, ServiceError>;

/// Incremental decoder for the server-sent events of a streamed run.
#[derive(Debug, Default)]
pub(crate) struct RunEventDecoder {
    buffer: Vec<u8>,
    open_tool_call: Option<OpenToolCall>,
    text_parts: Vec<usize>,
    finished: bool,
}

impl RunEventDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True once the run reached a terminal event; later input is ignored.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn process(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));
        let mut events = Vec::new();

        while let Some(end) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if self.finished {
                continue;
            }
            let frame = String::from_utf8_lossy(&frame);

            let mut event_type = None;
            let mut data_lines = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_type = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start());
                }
            }

            if data_lines.is_empty() {
                continue;
            }
            let data = data_lines.join("\n");
            if data == "[DONE]" {
                self.finished = true;
                continue;
            }

            match event_type {
                Some(event_type) => self.decode(&event_type, &data, &mut events),
                None => tracing::debug!("ignoring run stream frame without event name"),
            }
        }

        events
    }

    /// Called when the response body ends. A run that never reported a
    /// terminal status is a fault.
    pub(crate) fn finish(&mut self) -> Option<DecodedEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(Err(ServiceError::Run(RunFault::new(
            "stream_interrupted",
            "run stream ended before the run finished",
        ))))
    }

    fn decode(&mut self, event_type: &str, data: &str, out: &mut Vec<DecodedEvent>) {
        match event_type {
            "thread.run.created" => match parse::<RunObject>(event_type, data) {
                Ok(run) => out.push(Ok(RunEvent::RunCreated { run_id: run.id })),
                Err(err) => out.push(Err(err)),
            },
            "thread.run.step.delta" => match parse::<RunStepDeltaObject>(event_type, data) {
                Ok(step) => self.decode_step_delta(step, out),
                Err(err) => out.push(Err(err)),
            },
            "thread.run.step.completed" => match parse::<RunStepObject>(event_type, data) {
                Ok(step) => {
                    if let Some(open) = self.open_tool_call.take_if(|open| open.step_id == step.id)
                    {
                        out.push(Ok(RunEvent::ToolCallDone { kind: open.kind }));
                    }
                }
                Err(err) => out.push(Err(err)),
            },
            "thread.message.created" => {
                self.text_parts.clear();
                out.push(Ok(RunEvent::MessageCreated));
            }
            "thread.message.delta" => match parse::<MessageDeltaObject>(event_type, data) {
                Ok(message) => self.decode_message_delta(message.delta, out),
                Err(err) => out.push(Err(err)),
            },
            "thread.message.completed" => out.push(Ok(RunEvent::MessageDone)),
            "thread.run.completed" | "thread.run.cancelled" => self.finished = true,
            "thread.run.failed" | "thread.run.expired" | "thread.run.incomplete" => {
                self.finished = true;
                let fault = match serde_json::from_str::<RunObject>(data) {
                    Ok(RunObject {
                        last_error: Some(error),
                        ..
                    }) => RunFault::new(error.code, error.message),
                    _ => RunFault::new(
                        format!("run_{}", event_type.trim_start_matches("thread.run.")),
                        format!("run ended with status {}", event_type),
                    ),
                };
                out.push(Err(ServiceError::Run(fault)));
            }
            "thread.run.requires_action" => {
                self.finished = true;
                out.push(Err(ServiceError::Run(RunFault::new(
                    "requires_action",
                    "the assistant requested a function call, which this relay does not execute",
                ))));
            }
            "error" => {
                self.finished = true;
                out.push(Err(ServiceError::Run(error_fault(data))));
            }
            other => tracing::trace!(event = other, "ignoring run stream event"),
        }
    }

    fn decode_step_delta(&mut self, step: RunStepDeltaObject, out: &mut Vec<DecodedEvent>) {
        let Some(StepDetailsDelta::ToolCalls { tool_calls }) = step.delta.step_details else {
            return;
        };

        for call in tool_calls {
            let current = OpenToolCall {
                step_id: step.id.clone(),
                index: call.index,
                kind: call.kind,
            };
            if let Some(open) = self.open_tool_call.take_if(|open| {
                open.step_id != current.step_id || open.index != current.index
            }) {
                out.push(Ok(RunEvent::ToolCallDone { kind: open.kind }));
            }
            if self.open_tool_call.is_none() {
                out.push(Ok(RunEvent::ToolCallCreated { kind: call.kind }));
                self.open_tool_call = Some(current);
            }

            let Some(code) = call.code_interpreter else {
                continue;
            };
            let input = code.input.filter(|input| !input.is_empty());
            let outputs: Vec<ToolOutput> = code
                .outputs
                .into_iter()
                .map(|output| match output {
                    CodeInterpreterOutput::Logs { logs } => ToolOutput::Logs(logs),
                    CodeInterpreterOutput::Image { image } => ToolOutput::Image {
                        file_id: image.file_id,
                    },
                })
                .collect();
            if input.is_some() || !outputs.is_empty() {
                out.push(Ok(RunEvent::ToolCallDelta {
                    kind: call.kind,
                    input,
                    outputs,
                }));
            }
        }
    }

    fn decode_message_delta(&mut self, delta: MessageDelta, out: &mut Vec<DecodedEvent>) {
        let mut content = Vec::new();
        for part in delta.content {
            match part {
                MessageContentDelta::Text { index, text } => {
                    if !self.text_parts.contains(&index) {
                        self.text_parts.push(index);
                        out.push(Ok(RunEvent::TextCreated));
                    }
                    if let Some(value) = text.and_then(|text| text.value) {
                        content.push(ContentPart::Text { value });
                    }
                }
                MessageContentDelta::ImageFile { image_file } => {
                    content.push(ContentPart::ImageRef {
                        file_id: image_file.file_id,
                    });
                }
                MessageContentDelta::Other => {}
            }
        }
        if !content.is_empty() {
            out.push(Ok(RunEvent::MessageDelta { content }));
        }
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn parse<T: for<'de> Deserialize<'de>>(event_type: &str, data: &str) -> Result<T, ServiceError> {
    serde_json::from_str(data)
        .map_err(|err| ServiceError::MalformedEvent(format!("{}: {}", event_type, err)))
}

fn error_fault(data: &str) -> RunFault {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => return RunFault::new("server_error", data),
    };
    let error = value.get("error").unwrap_or(&value);
    let code = error
        .get("code")
        .and_then(|code| code.as_str())
        .unwrap_or("server_error");
    let message = error
        .get("message")
        .and_then(|message| message.as_str())
        .unwrap_or(data);
    RunFault::new(code, message)
}
