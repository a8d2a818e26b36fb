use crate::protocol::RunFault;
use thiserror::Error;

/// Failures at the conversation service boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("conversation service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("conversation service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected response from conversation service: {0}")]
    UnexpectedResponse(String),

    #[error("malformed run event: {0}")]
    MalformedEvent(String),

    #[error("failed to fetch file {file_id}: {reason}")]
    Fetch { file_id: String, reason: String },

    #[error("run failed: {0}")]
    Run(RunFault),
}

impl ServiceError {
    /// A single bad event must not end the run; everything else does.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ServiceError::MalformedEvent(_))
    }

    pub fn into_run_fault(self) -> RunFault {
        match self {
            ServiceError::Run(fault) => fault,
            ServiceError::UpstreamUnavailable(message) => {
                RunFault::new("upstream_unavailable", message)
            }
            ServiceError::Rejected { status, body } => {
                RunFault::new("upstream_rejected", format!("status {}: {}", status, body))
            }
            other => RunFault::new("run_error", other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::UnexpectedResponse(err.to_string())
        } else {
            ServiceError::UpstreamUnavailable(err.to_string())
        }
    }
}
