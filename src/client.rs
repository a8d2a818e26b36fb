use crate::protocol::{Fragment, Framing, RunAssistantRequest, UploadFileRequest};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use reqwest::Client as HttpClient;
use std::error::Error;
use std::path::Path;

pub struct ClientConfig {
    pub base_url: String,
    /// Must match the framing the relay serves.
    pub framing: Framing,
}

#[derive(Clone)]
pub struct ClientSession {
    base_url: String,
    framing: Framing,
    thread_id: String,
    http: HttpClient,
}

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

impl ClientSession {
    /// Opens a new thread, uploading `file` into it first when given.
    pub async fn connect(config: ClientConfig, file: Option<&Path>) -> ClientResult<Self> {
        let base_url = normalize_base_url(&config.base_url);
        let http = HttpClient::new();

        let request = match file {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or("file path has no file name")?;
                http.post(format!("{}/upload_file_and_create_thread", base_url))
                    .json(&UploadFileRequest {
                        file_name,
                        file_base64: BASE64.encode(bytes),
                    })
            }
            None => http.post(format!("{}/create_thread", base_url)),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to create thread: {} - {}", status, body).into());
        }

        let thread_id: String = response.json().await?;
        Ok(Self::attach(
            ClientConfig {
                base_url,
                framing: config.framing,
            },
            thread_id,
        ))
    }

    /// Continues an existing thread.
    pub fn attach(config: ClientConfig, thread_id: String) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            framing: config.framing,
            thread_id,
            http: HttpClient::new(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Sends a message and feeds each streamed fragment to `on_fragment` as it
    /// arrives.
    pub async fn run<F>(&self, message: String, mut on_fragment: F) -> ClientResult<()>
    where
        F: FnMut(Fragment),
    {
        let response = self
            .http
            .post(format!("{}/run_assistant", self.base_url))
            .json(&RunAssistantRequest {
                thread_id: self.thread_id.clone(),
                message,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to run assistant: {} - {}", status, body).into());
        }

        let mut stream = response.bytes_stream();
        let mut parser = FrameParser::new(self.framing);

        while let Some(chunk) = stream.next().await {
            for fragment in parser.push(&chunk?) {
                on_fragment(fragment);
            }
        }

        Ok(())
    }
}

/// Splits a streamed response body back into fragments. Raw framing has no
/// frame boundaries, so every decoded chunk becomes one content fragment.
struct FrameParser {
    framing: Framing,
    pending: Vec<u8>,
    buffer: String,
}

impl FrameParser {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: Vec::new(),
            buffer: String::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Fragment> {
        self.pending.extend_from_slice(chunk);
        let text = self.take_utf8();

        match self.framing {
            Framing::Raw if text.is_empty() => Vec::new(),
            Framing::Raw => vec![Fragment::Content { content: text }],
            Framing::Sse => {
                if text.contains('\r') {
                    self.buffer.push_str(&text.replace("\r\n", "\n"));
                } else {
                    self.buffer.push_str(&text);
                }
                self.split_frames()
            }
        }
    }

    // Keeps a multi-byte character split across chunks until it is complete.
    fn take_utf8(&mut self) -> String {
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let bytes: Vec<u8> = self.pending.drain(..valid).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn split_frames(&mut self) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let raw_event = self.buffer[..idx].to_string();
            self.buffer = self.buffer[idx + 2..].to_string();

            if let Some(data) = extract_sse_data(&raw_event) {
                if let Ok(fragment) = serde_json::from_str::<Fragment>(&data) {
                    fragments.push(fragment);
                }
            }
        }
        fragments
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Framing, RunFault};

    #[test]
    fn parser_reassembles_frames_split_across_chunks() {
        let mut parser = FrameParser::new(Framing::Sse);
        let framed = format!(
            "{}{}",
            Framing::Sse.encode(&Fragment::text("```\n")),
            Framing::Sse.encode(&Fragment::Fault {
                error: RunFault::new("server_error", "boom"),
            })
        );
        let (head, tail) = framed.as_bytes().split_at(10);

        assert!(parser.push(head).is_empty());
        assert_eq!(
            parser.push(tail),
            vec![
                Fragment::text("```\n"),
                Fragment::Fault {
                    error: RunFault::new("server_error", "boom")
                }
            ]
        );
    }

    #[test]
    fn raw_framing_yields_text_and_holds_split_characters() {
        let mut parser = FrameParser::new(Framing::Raw);
        let body = "caf\u{e9}\n[error] server_error: boom\n".as_bytes();
        let (head, tail) = body.split_at(4);

        assert_eq!(parser.push(head), vec![Fragment::text("caf")]);
        assert_eq!(
            parser.push(tail),
            vec![Fragment::text("\u{e9}\n[error] server_error: boom\n")]
        );
        assert!(parser.push(b"").is_empty());
    }

    #[test]
    fn attach_normalizes_base_url() {
        let session = ClientSession::attach(
            ClientConfig {
                base_url: "http://localhost:8000/".into(),
                framing: Framing::Sse,
            },
            "thread_1".into(),
        );
        assert_eq!(session.base_url, "http://localhost:8000");
        assert_eq!(session.thread_id(), "thread_1");
    }
}
