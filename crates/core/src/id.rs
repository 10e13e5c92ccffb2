//! Strongly-typed identifiers.
//!
//! Ids are opaque strings: callers may supply their own, or ask for a
//! generated one of the form `<prefix>_<uuid-v7>`.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClassifiedError;

/// Identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

macro_rules! impl_string_id {
    ($t:ty, $prefix:literal, $name:literal) => {
        impl $t {
            /// Generate a fresh, time-ordered identifier.
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            /// Wrap a caller-supplied identifier. Blank ids are rejected.
            pub fn new(value: impl Into<String>) -> Result<Self, ClassifiedError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ClassifiedError::validation(format!(
                        "{} must not be empty",
                        $name
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = ClassifiedError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_id!(JobId, "job", "JobId");
impl_string_id!(BatchId, "batch", "BatchId");

impl BatchId {
    /// Job id used for the `index`-th item of this batch.
    pub fn item_job_id(&self, index: usize) -> JobId {
        JobId(format!("{}_image_{}", self.0, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert!(a.as_str().starts_with("job_"));
        assert_ne!(a, b);
        assert!(BatchId::generate().as_str().starts_with("batch_"));
    }

    #[test]
    fn blank_ids_are_rejected() {
        let err = JobId::new("   ").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!("".parse::<BatchId>().is_err());
        assert_eq!("abc".parse::<JobId>().unwrap().as_str(), "abc");
    }

    #[test]
    fn batch_item_ids_embed_index() {
        let batch = BatchId::new("b1").unwrap();
        assert_eq!(batch.item_job_id(3).as_str(), "b1_image_3");
    }
}
