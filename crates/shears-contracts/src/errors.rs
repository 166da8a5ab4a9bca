use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type GenerationResult<T> = Result<T, GenerationError>;

/// Failures reaching the remote model endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no API credential configured (set {0})")]
    MissingCredential(String),

    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    #[error("endpoint rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl TransportError {
    pub fn request(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Request {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        match self {
            Self::MissingCredential(_) => true,
            Self::Rejected { status, .. } => matches!(status, 401 | 403),
            Self::Request { .. } => false,
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Rejected { status: 429, .. })
    }
}

/// Every failure a generation action can surface to its caller.
///
/// None of these are fatal: the session keeps its previous state and the
/// user may retry.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("{0} is disabled in this configuration")]
    FeatureDisabled(&'static str),
}

impl GenerationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InputValidation(message.into())
    }

    /// Stable identifier used in the event log.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::MalformedResponse(_) => "malformed_response",
            Self::InputValidation(_) => "input_validation",
            Self::FeatureDisabled(_) => "feature_disabled",
        }
    }
}
