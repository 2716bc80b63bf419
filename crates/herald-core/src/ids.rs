//! Branded ID newtypes.
//!
//! Each identifier is a distinct newtype around `String` so a receiver id can
//! never be passed where an event id is expected. Generated ids are UUID v7
//! (time-ordered, random tail), which keeps them collision-free across
//! concurrent producers and across processes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh UUID v7 id.
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Wrap an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the id and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier of a delivered event. Clients dedupe on it.
    EventId
}

branded_id! {
    /// The user identity a connection and its events are addressed to.
    ///
    /// Supplied by upstream identity middleware and trusted as-is.
    ReceiverId
}

branded_id! {
    /// Identifier of one open client stream within this process.
    ConnectionId
}

branded_id! {
    /// Identifier of a backend process, stamped on outgoing fan-out envelopes.
    ProcessId
}
