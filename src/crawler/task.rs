use std::any::Any;
use thiserror::Error;

/// Terminal failure of one processing task.
///
/// Every variant is handled the same way by the crawler: the request's fingerprint
/// is released, the failure counter goes up and the cause is logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The downloader reported an error in-band
    #[error("download failed: {0}")]
    Download(String),

    /// The response names a rule the spider does not define
    #[error("unknown rule: {0}")]
    UnknownRule(String),

    /// The rule's parse function returned an error
    #[error("parse failed: {0}")]
    Parse(String),

    /// The task panicked
    #[error("panicked: {0}")]
    Panic(String),

    /// The pipeline refused the page's output
    #[error("output refused: {0}")]
    Output(String),
}

impl TaskError {
    /// Build a `Panic` error from a caught unwind payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskError::Panic(message)
    }

    /// Short label used in logs
    pub fn stage(&self) -> &'static str {
        match self {
            TaskError::Download(_) => "download",
            TaskError::Output(_) => "output",
            _ => "process",
        }
    }
}

/// What a successful processing task handed to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Processed {
    pub url: String,
    pub items: usize,
    pub files: usize,
}

/// Result type of one processing task
pub type TaskOutcome = Result<Processed, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(TaskError::from_panic(payload), TaskError::Panic("boom".into()));

        let payload: Box<dyn Any + Send> = Box::new(String::from("index out of bounds"));
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panic("index out of bounds".into())
        );

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert!(matches!(TaskError::from_panic(payload), TaskError::Panic(_)));
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(TaskError::Download("x".into()).stage(), "download");
        assert_eq!(TaskError::Parse("x".into()).stage(), "process");
        assert_eq!(TaskError::Panic("x".into()).stage(), "process");
        assert_eq!(TaskError::Output("closed".into()).stage(), "output");
    }
}
