use jobflow_core::{ClassifiedError, ErrorKind};
use jobflow_jobs::JobError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no processor registered for job type `{0}`")]
    UnknownJobType(String),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnknownJobType(_) => ErrorKind::Validation,
            PipelineError::Job(err) => err.kind(),
        }
    }
}

impl From<PipelineError> for ClassifiedError {
    fn from(err: PipelineError) -> Self {
        ClassifiedError::new(err.kind(), err.to_string())
    }
}
