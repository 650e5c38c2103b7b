//! Identifier newtypes and request ID generation.
//!
//! Service, partition and files-artifact IDs are opaque strings chosen by
//! the test author. They are wrapped so the three key spaces can't be mixed
//! up in maps and call signatures. Request IDs use a `prefix_` followed by a
//! UUIDv7, which keeps them unique and sortable by creation time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id! {
    /// Identifies a service within one network context.
    ServiceId
}

string_id! {
    /// Identifies a partition. The empty string is the default partition.
    PartitionId
}

string_id! {
    /// Identifies a files artifact (an external archive mounted into services).
    FilesArtifactId
}

impl PartitionId {
    /// The default partition. Always a valid target, even if it was never
    /// declared or was repartitioned away.
    pub fn default_partition() -> Self {
        Self(String::new())
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate an RPC request ID: `req_<uuid7>`
pub fn request_id() -> String {
    prefixed_id("req")
}
