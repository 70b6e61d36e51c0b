//! Type-safe ID wrappers for comlink.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID newtypes with common functionality.
///
/// The optional third argument truncates the random part, for ids that a
/// human has to type back (confirmation replies).
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        define_id!(@impl $name, $prefix, Uuid::new_v4().to_string());
    };
    ($name:ident, $prefix:literal, $len:literal) => {
        define_id!(@impl $name, $prefix, {
            let mut hex = Uuid::new_v4().simple().to_string();
            hex.truncate($len);
            hex
        });
    };
    (@impl $name:ident, $prefix:literal, $random:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new random ID.
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, $random))
            }

            /// Creates an ID from an existing string (for deserialization/testing).
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Returns the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(MessageId, "msg");
define_id!(ConnectionId, "conn");
define_id!(ConfirmationId, "conf", 8);
