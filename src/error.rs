use solana_sdk::{pubkey::Pubkey, signature::Signature};
use strum::IntoStaticStr;
use thiserror::Error;

/// Failures of the detection pipeline.
///
/// Everything except `Transport` is scoped to a single signature: it is logged
/// and the pipeline moves on to the next notification.
#[derive(Debug, Error, IntoStaticStr)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transaction {signature} not found")]
    NotFound { signature: Signature },

    #[error("fetch transaction {signature} failed: {reason}")]
    FetchFailed { signature: Signature, reason: String },

    #[error("transaction {signature} has no top level instruction for program {program_id}")]
    NoMatchingInstruction {
        signature: Signature,
        program_id: Pubkey,
    },

    #[error(
        "instruction in transaction {signature} has {len} accounts, layout v{layout_version} needs at least {min}"
    )]
    MalformedInstruction {
        signature: Signature,
        len: usize,
        min: usize,
        layout_version: u8,
    },

    #[error("extract {signature} error: {reason}")]
    ExtractionFailure { signature: String, reason: String },
}

impl PipelineError {
    pub fn transport(err_msg: impl Into<String>) -> Self {
        PipelineError::Transport(err_msg.into())
    }

    pub fn extraction(signature: impl ToString, reason: impl Into<String>) -> Self {
        PipelineError::ExtractionFailure {
            signature: signature.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable name of the failure, used as the `kind` field of diagnostics.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}
