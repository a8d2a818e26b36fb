use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::conversation::{ConversationService, Role, RunEvent, RunEventStream};
use crate::error::ServiceError;
use crate::handler::{EventHandler, RenderSettings};
use crate::stream::{FragmentStream, fragment_queue};

/// Starts runs and drives their events onto a fragment stream in the
/// background.
#[derive(Clone)]
pub struct RunDriver {
    service: Arc<dyn ConversationService>,
    settings: RenderSettings,
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(ServiceError),
}

impl RunDriver {
    pub fn new(service: Arc<dyn ConversationService>, settings: RenderSettings) -> Self {
        Self { service, settings }
    }

    /// Submits the message and starts the run. Failures up to this point are
    /// returned directly and no stream is opened.
    pub async fn start(
        &self,
        thread_id: &str,
        message: &str,
    ) -> Result<FragmentStream, ServiceError> {
        self.service
            .post_message(thread_id, Role::User, message)
            .await?;
        let events = self.service.start_run(thread_id).await?;

        let (tx, stream) = fragment_queue();
        let cancel = CancellationToken::new();
        let handler = EventHandler::new(Arc::clone(&self.service), tx, self.settings);

        let span = tracing::info_span!("run", thread_id = %thread_id);
        tokio::spawn(
            drive(
                Arc::clone(&self.service),
                thread_id.to_string(),
                events,
                handler,
                cancel.clone(),
            )
            .instrument(span),
        );

        Ok(stream.cancel_on_drop(cancel))
    }
}

async fn drive(
    service: Arc<dyn ConversationService>,
    thread_id: String,
    mut events: RunEventStream,
    mut handler: EventHandler,
    cancel: CancellationToken,
) {
    let mut run_id: Option<String> = None;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Outcome::Cancelled,
            next = events.next() => next,
        };

        match next {
            None => break Outcome::Completed,
            Some(Ok(event)) => {
                if let RunEvent::RunCreated { run_id: id } = &event {
                    tracing::debug!(run_id = %id, "run created");
                    run_id = Some(id.clone());
                }
                handler.handle(event).await;
                if handler.queue().is_closed() {
                    break Outcome::Cancelled;
                }
            }
            Some(Err(err)) if err.is_recoverable() => handler.skip_malformed(&err),
            Some(Err(err)) => break Outcome::Failed(err),
        }
    };

    let queue = handler.finish();
    match outcome {
        Outcome::Completed => tracing::info!("run completed"),
        Outcome::Failed(err) => {
            tracing::error!(error = %err, "run failed");
            queue.push_fault(err.into_run_fault());
        }
        Outcome::Cancelled => {
            tracing::info!("stream consumer went away, cancelling run");
            match run_id.as_deref() {
                Some(run_id) => {
                    if let Err(err) = service.cancel_run(&thread_id, run_id).await {
                        tracing::warn!(run_id, error = %err, "failed to cancel run");
                    }
                }
                None => tracing::warn!("run id not known yet, upstream run left running"),
            }
        }
    }
    queue.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ContentPart, ToolKind, ToolOutput};
    use crate::protocol::{Fragment, RunFault};
    use crate::render::{BLOCK_CLOSE, BLOCK_OPEN, PARAGRAPH_BREAK};
    use crate::testing::ScriptedService;
    use std::time::Duration;

    fn driver(service: Arc<ScriptedService>) -> RunDriver {
        RunDriver::new(service, RenderSettings::default())
    }

    fn text(fragment: &str) -> Fragment {
        Fragment::text(fragment)
    }

    #[tokio::test]
    async fn code_interpreter_run_streams_in_event_order() {
        let service = Arc::new(ScriptedService::new().with_run(vec![
            Ok(RunEvent::RunCreated {
                run_id: "run_1".into(),
            }),
            Ok(RunEvent::ToolCallCreated {
                kind: ToolKind::CodeInterpreter,
            }),
            Ok(RunEvent::ToolCallDelta {
                kind: ToolKind::CodeInterpreter,
                input: Some("print(2+2)".into()),
                outputs: vec![],
            }),
            Ok(RunEvent::ToolCallDelta {
                kind: ToolKind::CodeInterpreter,
                input: None,
                outputs: vec![ToolOutput::Logs("4".into())],
            }),
            Ok(RunEvent::ToolCallDone {
                kind: ToolKind::CodeInterpreter,
            }),
            Ok(RunEvent::MessageCreated),
            Ok(RunEvent::MessageDelta {
                content: vec![ContentPart::Text {
                    value: "The answer is 4.".into(),
                }],
            }),
            Ok(RunEvent::MessageDone),
        ]));

        let stream = driver(Arc::clone(&service))
            .start("thread_1", "2+2?")
            .await
            .expect("run starts");
        let fragments: Vec<Fragment> = stream.collect().await;

        assert_eq!(
            fragments,
            vec![
                text("<i>Launching Code Interpreter...</i>\n"),
                text(BLOCK_OPEN),
                text("print(2+2)"),
                text("\n4\n"),
                text(BLOCK_CLOSE),
                text("The answer is 4."),
                text(PARAGRAPH_BREAK),
            ]
        );
        assert_eq!(
            service.posted(),
            vec![("thread_1".to_string(), Role::User, "2+2?".to_string())]
        );
    }

    #[tokio::test]
    async fn run_fault_ends_stream_with_error_fragment() {
        let fault = RunFault::new("server_error", "the run failed");
        let service = Arc::new(ScriptedService::new().with_run(vec![
            Ok(RunEvent::MessageDelta {
                content: vec![ContentPart::Text { value: "one".into() }],
            }),
            Ok(RunEvent::MessageDelta {
                content: vec![ContentPart::Text { value: "two".into() }],
            }),
            Err(ServiceError::Run(fault.clone())),
            Ok(RunEvent::MessageDone),
        ]));

        let stream = driver(service).start("thread_1", "hi").await.expect("run starts");
        let fragments = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .expect("stream terminates");

        assert_eq!(
            fragments,
            vec![text("one"), text("two"), Fragment::Fault { error: fault }]
        );
    }

    #[tokio::test]
    async fn fault_inside_tool_call_closes_block_before_error() {
        let service = Arc::new(ScriptedService::new().with_run(vec![
            Ok(RunEvent::ToolCallCreated {
                kind: ToolKind::CodeInterpreter,
            }),
            Err(ServiceError::Run(RunFault::new("run_expired", "too slow"))),
        ]));

        let fragments: Vec<Fragment> = driver(service)
            .start("thread_1", "hi")
            .await
            .expect("run starts")
            .collect()
            .await;

        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[2], text(BLOCK_CLOSE));
        assert!(matches!(fragments[3], Fragment::Fault { .. }));
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let service = Arc::new(ScriptedService::new().with_run(vec![
            Ok(RunEvent::MessageDelta {
                content: vec![ContentPart::Text { value: "A".into() }],
            }),
            Err(ServiceError::MalformedEvent("missing delta".into())),
            Ok(RunEvent::MessageDelta {
                content: vec![ContentPart::Text { value: "B".into() }],
            }),
        ]));

        let fragments: Vec<Fragment> = driver(service)
            .start("thread_1", "hi")
            .await
            .expect("run starts")
            .collect()
            .await;
        assert_eq!(fragments, vec![text("A"), text("B")]);
    }

    #[tokio::test]
    async fn image_fetch_fault_still_terminates() {
        let service = Arc::new(ScriptedService::new().with_run(vec![Ok(
            RunEvent::MessageDelta {
                content: vec![ContentPart::ImageRef {
                    file_id: "file-gone".into(),
                }],
            },
        )]));

        let fragments: Vec<Fragment> = driver(service)
            .start("thread_1", "plot it")
            .await
            .expect("run starts")
            .collect()
            .await;
        assert_eq!(
            fragments,
            vec![text(&crate::handler::image_placeholder("file-gone"))]
        );
    }

    #[tokio::test]
    async fn unreachable_service_fails_before_streaming() {
        let service = Arc::new(ScriptedService::new().unavailable());
        let result = driver(service).start("thread_1", "hi").await;
        assert!(matches!(result, Err(ServiceError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_interleave() {
        let service = Arc::new(
            ScriptedService::new()
                .with_run(vec![Ok(RunEvent::MessageDelta {
                    content: vec![
                        ContentPart::Text { value: "A".into() },
                        ContentPart::Text { value: "B".into() },
                    ],
                })])
                .with_run(vec![Ok(RunEvent::MessageDelta {
                    content: vec![
                        ContentPart::Text { value: "X".into() },
                        ContentPart::Text { value: "Y".into() },
                    ],
                })]),
        );
        let driver = driver(service);

        let first = driver.start("thread_1", "a").await.expect("first run");
        let second = driver.start("thread_2", "b").await.expect("second run");
        let (first, second): (Vec<Fragment>, Vec<Fragment>) =
            tokio::join!(first.collect(), second.collect());

        assert_eq!(first, vec![text("A"), text("B")]);
        assert_eq!(second, vec![text("X"), text("Y")]);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_run() {
        let service = Arc::new(
            ScriptedService::new()
                .with_run(vec![
                    Ok(RunEvent::RunCreated {
                        run_id: "run_7".into(),
                    }),
                    Ok(RunEvent::MessageDelta {
                        content: vec![ContentPart::Text {
                            value: "partial".into(),
                        }],
                    }),
                ])
                .hold_open(),
        );

        let mut stream = driver(Arc::clone(&service))
            .start("thread_9", "long task")
            .await
            .expect("run starts");
        assert_eq!(stream.next().await, Some(text("partial")));
        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), async {
            while service.cancelled().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run cancelled");
        assert_eq!(
            service.cancelled(),
            vec![("thread_9".to_string(), "run_7".to_string())]
        );
    }

    #[tokio::test]
    async fn dropping_before_run_created_abandons_without_cancel() {
        let service = Arc::new(
            ScriptedService::new()
                .with_run(vec![Ok(RunEvent::MessageDelta {
                    content: vec![ContentPart::Text {
                        value: "early".into(),
                    }],
                })])
                .hold_open(),
        );

        let mut stream = driver(Arc::clone(&service))
            .start("thread_3", "hi")
            .await
            .expect("run starts");
        assert_eq!(stream.next().await, Some(text("early")));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.cancelled().is_empty());
    }
}
