use thiserror::Error;

/// Errors surfaced by the loss core.
///
/// The five `Compute*`-stage variants are the fixed per-stage failure codes
/// of the compute pipeline; the driver aborts on the first one. `Io`, `Json`
/// and `InvalidInput` belong to the configuration layer and the opt-in
/// validators, never to the hot path.
#[derive(Debug, Error)]
pub enum TransducerError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("denominator max-reduction failed: {message}")]
    DenominatorReduceMax { message: String },
    #[error("denominator sum-reduction failed: {message}")]
    DenominatorReduceSum { message: String },
    #[error("log-probability extraction failed: {message}")]
    LogProbs { message: String },
    #[error("alpha/beta/cost recursion failed: {message}")]
    AlphasBetasCosts { message: String },
    #[error("gradient assembly failed: {message}")]
    Gradients { message: String },
}

impl TransducerError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}
