//! In-memory conversation service for tests. Runs replay scripted events.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::conversation::{ConversationService, Role, RunEvent, RunEventStream};
use crate::error::ServiceError;

pub(crate) type ScriptedItem = Result<RunEvent, ServiceError>;

#[derive(Default)]
pub(crate) struct ScriptedService {
    runs: Mutex<VecDeque<Vec<ScriptedItem>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    threads: Mutex<Vec<Vec<String>>>,
    posted: Mutex<Vec<(String, Role, String)>>,
    cancelled: Mutex<Vec<(String, String)>>,
    unavailable: bool,
    hold_open: bool,
}

impl ScriptedService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_run(self, events: Vec<ScriptedItem>) -> Self {
        self.runs.lock().unwrap().push_back(events);
        self
    }

    pub(crate) fn with_file(self, file_id: &str, bytes: &[u8]) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(file_id.to_string(), bytes.to_vec());
        self
    }

    /// Every call fails as if the service could not be reached.
    pub(crate) fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Runs never finish on their own after the scripted events.
    pub(crate) fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub(crate) fn posted(&self) -> Vec<(String, Role, String)> {
        self.posted.lock().unwrap().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn threads(&self) -> Vec<Vec<String>> {
        self.threads.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.unavailable {
            Err(ServiceError::UpstreamUnavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConversationService for ScriptedService {
    async fn create_conversation(&self, file_ids: &[String]) -> Result<String, ServiceError> {
        self.check_available()?;
        let mut threads = self.threads.lock().unwrap();
        threads.push(file_ids.to_vec());
        Ok(format!("thread_{}", threads.len()))
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: Role,
        text: &str,
    ) -> Result<(), ServiceError> {
        self.check_available()?;
        self.posted
            .lock()
            .unwrap()
            .push((thread_id.to_string(), role, text.to_string()));
        Ok(())
    }

    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, ServiceError> {
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| ServiceError::Fetch {
                file_id: file_id.to_string(),
                reason: "not found".into(),
            })
    }

    async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ServiceError> {
        self.check_available()?;
        let file_id = format!("file-{}", file_name);
        self.files.lock().unwrap().insert(file_id.clone(), bytes);
        Ok(file_id)
    }

    async fn start_run(&self, _thread_id: &str) -> Result<RunEventStream, ServiceError> {
        self.check_available()?;
        let events = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        let scripted = stream::iter(events);
        if self.hold_open {
            Ok(scripted.chain(stream::pending()).boxed())
        } else {
            Ok(scripted.boxed())
        }
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ServiceError> {
        self.cancelled
            .lock()
            .unwrap()
            .push((thread_id.to_string(), run_id.to_string()));
        Ok(())
    }
}
