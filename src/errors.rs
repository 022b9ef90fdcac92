//! Sample-level failure classes
//!
//! Stage internals report failures as `SimpleError` messages. These are converted to a
//! `PipelineError` at the stage boundary so that the orchestrator can attach the sample stage
//! and window context, and so that pipeline failures stay distinct from validation outcomes.
//!

use std::fmt;

use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

/// Pipeline stages in execution order
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
pub enum PipelineStage {
    Setup,
    Split,
    Tag,
    Filter,
    Merge,
    SortIndex,
    Validate,
    Report,
}

#[derive(Debug)]
pub enum PipelineError {
    /// Input path or output location problems detected before any stage runs
    Configuration(String),

    /// A processing stage failed or produced no usable output
    ToolInvocation {
        stage: PipelineStage,
        window_index: Option<usize>,
        message: String,
    },

    /// Merge preconditions were not met for the sample
    PartialData(String),
}

impl PipelineError {
    pub fn tool(stage: PipelineStage, window_index: Option<usize>, err: SimpleError) -> Self {
        Self::ToolInvocation {
            stage,
            window_index,
            message: err.as_str().to_string(),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Configuration(_) => PipelineStage::Setup,
            Self::ToolInvocation { stage, .. } => *stage,
            Self::PartialData(_) => PipelineStage::Merge,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            Self::ToolInvocation {
                stage,
                window_index,
                message,
            } => match window_index {
                Some(window_index) => {
                    write!(f, "{stage} stage failed on window {window_index}: {message}")
                }
                None => write!(f, "{stage} stage failed: {message}"),
            },
            Self::PartialData(msg) => write!(f, "Incomplete window data for merge: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::tool(
            PipelineStage::Tag,
            Some(7),
            SimpleError::new("read name has no UMI"),
        );
        assert_eq!(err.stage(), PipelineStage::Tag);
        assert_eq!(
            err.to_string(),
            "Tag stage failed on window 7: read name has no UMI"
        );

        let err = PipelineError::PartialData("window 3 missing".to_string());
        assert_eq!(err.stage(), PipelineStage::Merge);
    }
}
