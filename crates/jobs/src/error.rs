use std::time::Duration;

use jobflow_core::{ClassifiedError, ErrorKind, JobId};

use crate::types::JobStatus;

/// Job manager error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("cannot {operation} job {id} while {status}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },
    #[error("invalid job input: {0}")]
    InvalidInput(String),
    #[error("unknown resource pool: {0}")]
    UnknownResource(String),
    #[error("insufficient resource {resource}: requested {requested}, available {available}")]
    ResourceExhausted {
        resource: String,
        requested: u64,
        available: u64,
    },
    #[error("timed out after {waited:?} waiting for job {id}")]
    WaitTimeout { id: JobId, waited: Duration },
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::NotFound(_) | JobError::ResourceExhausted { .. } => ErrorKind::Resource,
            JobError::AlreadyExists(_)
            | JobError::InvalidTransition { .. }
            | JobError::InvalidState { .. }
            | JobError::InvalidInput(_)
            | JobError::UnknownResource(_) => ErrorKind::Validation,
            JobError::WaitTimeout { .. } => ErrorKind::Timeout,
        }
    }
}

impl From<JobError> for ClassifiedError {
    fn from(err: JobError) -> Self {
        ClassifiedError::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_into_classified_error() {
        let id = JobId::new("j1").unwrap();
        let err: ClassifiedError = JobError::InvalidTransition {
            id,
            from: JobStatus::Completed,
            to: JobStatus::Cancelled,
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("completed -> cancelled"));

        let err: ClassifiedError = JobError::WaitTimeout {
            id: JobId::new("j2").unwrap(),
            waited: Duration::from_millis(10),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
