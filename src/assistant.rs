use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use crate::ai_sdk::{
    AssistantObject, CreateMessageRequest, CreateRunRequest, CreateThreadRequest, DecodedEvent,
    ObjectId, RunEventDecoder,
};
use crate::config::Config;
use crate::conversation::{ConversationService, Role, RunEventStream};
use crate::error::ServiceError;
use crate::protocol::RunFault;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Azure OpenAI Assistants API client. Built once at startup and shared by
/// every request.
pub struct AssistantClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_version: String,
    assistant_id: String,
    timeout: Duration,
    stream_idle: Duration,
}

impl AssistantClient {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::UpstreamUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("{}/openai", config.endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            assistant_id: config.assistant_id.clone(),
            timeout: config.request_timeout(),
            stream_idle: config.stream_idle(),
        })
    }

    pub(crate) async fn retrieve_assistant(&self) -> Result<AssistantObject, ServiceError> {
        let response = self
            .request(self.client.get(self.url(&format!("assistants/{}", self.assistant_id))))
            .send()
            .await?;
        json(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}?api-version={}", self.base_url, path, self.api_version)
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        self.streaming_request(builder).timeout(self.timeout)
    }

    fn streaming_request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("api-key", &self.api_key)
    }
}

#[async_trait]
impl ConversationService for AssistantClient {
    async fn create_conversation(&self, file_ids: &[String]) -> Result<String, ServiceError> {
        let response = self
            .request(self.client.post(self.url("threads")))
            .json(&CreateThreadRequest::with_files(file_ids))
            .send()
            .await?;
        let thread: ObjectId = json(response).await?;
        tracing::info!(thread_id = %thread.id, files = file_ids.len(), "created thread");
        Ok(thread.id)
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: Role,
        text: &str,
    ) -> Result<(), ServiceError> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("threads/{}/messages", thread_id))),
            )
            .json(&CreateMessageRequest {
                role: role.as_str(),
                content: text,
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, ServiceError> {
        let fetch = async {
            let response = self
                .request(self.client.get(self.url(&format!("files/{}/content", file_id))))
                .send()
                .await?;
            let bytes = check_status(response).await?.bytes().await?;
            Ok::<_, ServiceError>(bytes.to_vec())
        };

        fetch.await.map_err(|err| ServiceError::Fetch {
            file_id: file_id.to_string(),
            reason: err.to_string(),
        })
    }

    async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ServiceError> {
        let size = bytes.len();
        let form = Form::new()
            .text("purpose", "assistants")
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()));

        let response = self
            .request(self.client.post(self.url("files")))
            .multipart(form)
            .send()
            .await?;
        let file: ObjectId = json(response).await?;
        tracing::info!(file_id = %file.id, file_name, size, "uploaded file");
        Ok(file.id)
    }

    async fn start_run(&self, thread_id: &str) -> Result<RunEventStream, ServiceError> {
        let response = self
            .streaming_request(
                self.client
                    .post(self.url(&format!("threads/{}/runs", thread_id))),
            )
            .json(&CreateRunRequest {
                assistant_id: &self.assistant_id,
                stream: true,
            })
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(decode_run_stream(
            Box::pin(response.bytes_stream()),
            self.stream_idle,
        ))
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ServiceError> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("threads/{}/runs/{}/cancel", thread_id, run_id))),
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct RunStreamState {
    body: ByteStream,
    idle: Duration,
    decoder: RunEventDecoder,
    pending: VecDeque<DecodedEvent>,
    ended: bool,
}

/// Decodes a run's response body. A body that stays silent for longer than
/// `idle` ends the run with a `stream_interrupted` fault.
fn decode_run_stream(body: ByteStream, idle: Duration) -> RunEventStream {
    let state = RunStreamState {
        body,
        idle,
        decoder: RunEventDecoder::new(),
        pending: VecDeque::new(),
        ended: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.ended || state.decoder.is_finished() {
                return None;
            }

            let next = match tokio::time::timeout(state.idle, state.body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(idle_secs = state.idle.as_secs(), "run stream went silent");
                    state.ended = true;
                    state.pending.push_back(Err(ServiceError::Run(RunFault::new(
                        "stream_interrupted",
                        format!("no run events for {:?}", state.idle),
                    ))));
                    continue;
                }
            };

            match next {
                Some(Ok(chunk)) => state.pending.extend(state.decoder.process(&chunk)),
                Some(Err(err)) => {
                    state.ended = true;
                    state.pending.push_back(Err(ServiceError::Run(RunFault::new(
                        "stream_interrupted",
                        err.to_string(),
                    ))));
                }
                None => {
                    state.ended = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body = %body, "assistant service returned an error");
    Err(ServiceError::Rejected {
        status: status.as_u16(),
        body,
    })
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    check_status(response)
        .await?
        .json()
        .await
        .map_err(|e| ServiceError::UnexpectedResponse(e.to_string()))
}
