use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;

use crate::conversation::{ConversationService, RunEvent};
use crate::error::ServiceError;
use crate::render::{Output, RenderState};
use crate::stream::FragmentSender;

pub const DEFAULT_IMAGE_WIDTH: u32 = 750;

#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    /// Declared display width of inline images, in pixels.
    pub image_width: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            image_width: DEFAULT_IMAGE_WIDTH,
        }
    }
}

/// Turns the events of one run into fragments on the queue.
pub struct EventHandler {
    state: RenderState,
    service: Arc<dyn ConversationService>,
    queue: FragmentSender,
    settings: RenderSettings,
}

impl EventHandler {
    pub fn new(
        service: Arc<dyn ConversationService>,
        queue: FragmentSender,
        settings: RenderSettings,
    ) -> Self {
        Self {
            state: RenderState::new(),
            service,
            queue,
            settings,
        }
    }

    pub fn queue(&self) -> &FragmentSender {
        &self.queue
    }

    pub async fn handle(&mut self, event: RunEvent) {
        for output in self.state.apply(&event) {
            match output {
                Output::Text(text) => {
                    self.queue.push_text(text);
                }
                Output::Image { file_id } => self.push_image(&file_id).await,
            }
        }
    }

    pub fn skip_malformed(&self, err: &ServiceError) {
        tracing::warn!(error = %err, phase = ?self.state.phase(), "dropping malformed run event");
    }

    /// Closes any block still open and hands the queue back so the caller can
    /// append the terminal fragments.
    pub fn finish(mut self) -> FragmentSender {
        if let Some(close) = self.state.close_open_block() {
            tracing::debug!("closing tool call block left open by the run");
            self.queue.push_text(close);
        }
        self.queue
    }

    async fn push_image(&mut self, file_id: &str) {
        match self.service.fetch_file(file_id).await {
            Ok(bytes) => {
                self.queue
                    .push_text(inline_image(&bytes, self.settings.image_width));
            }
            Err(err) => {
                tracing::warn!(file_id, error = %err, "inline image fetch failed");
                if let Some(close) = self.state.close_open_block() {
                    self.queue.push_text(close);
                }
                self.queue.push_text(image_placeholder(file_id));
            }
        }
    }
}

pub(crate) fn inline_image(bytes: &[u8], width: u32) -> String {
    format!(
        "<img width=\"{}px\" src=\"data:image/png;base64,{}\"/><br><br>",
        width,
        BASE64.encode(bytes)
    )
}

pub(crate) fn image_placeholder(file_id: &str) -> String {
    format!("<i>[image {} could not be loaded]</i><br><br>", file_id)
}
