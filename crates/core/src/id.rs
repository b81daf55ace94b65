//! Identifiers for builds and workers.
//!
//! Work items themselves stay opaque `String`s; the queue never looks inside.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one coordinated run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

/// Identifier of one worker process within a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(BuildId);
impl_string_newtype!(WorkerId);

impl WorkerId {
    /// Random worker id (UUIDv7), for runs where the CI system provides none.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::generate()
    }
}
