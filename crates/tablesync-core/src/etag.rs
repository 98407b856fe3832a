//! Version tokens.
//!
//! Three opaque tokens version the data held by the engine:
//!
//! - [`RowETag`]: one row; replaced on every mutation of that row.
//! - [`DataETag`]: the whole row-set of one table generation; replaced by
//!   every committed change set.
//! - [`SchemaETag`]: one schema generation of a table.
//!
//! Fresh tokens are `uuid:` followed by a random (v4) UUID. Tokens received
//! from clients are treated as opaque strings and only ever compared for
//! equality.
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ETAG_PREFIX: &str = "uuid:";

fn fresh() -> String {
    format!("{ETAG_PREFIX}{}", Uuid::new_v4())
}

macro_rules! etag_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Allocate a token that has never been issued before.
            pub fn generate() -> Self {
                Self(fresh())
            }

            /// Wrap a token received from a client or read from storage.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The token text.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the token and return its text.
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

etag_type!(
    /// Version token of a single row.
    RowETag
);

etag_type!(
    /// Version token of a table generation's entire row-set.
    DataETag
);

etag_type!(
    /// Identifies one schema generation of a table.
    SchemaETag
);
