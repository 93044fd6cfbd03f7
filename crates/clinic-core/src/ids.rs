//! Identifier newtypes.
//!
//! Server-minted identifiers ([`ConnectionId`]) are UUID v7 strings with a
//! short prefix so they are recognizable in logs. Identifiers chosen by the
//! client ([`QueryId`] is the id of the `query` frame, [`UserId`] comes from
//! the JWT subject) are wrapped as-is. [`SessionId`] is the only one with a
//! format constraint and can only be built through [`SessionId::parse`].

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing string value.
            #[must_use]
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
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
    };
}

branded_id!(
    /// Server-assigned identifier of a live transport connection.
    ConnectionId
);

branded_id!(
    /// Identifier of an in-flight query (the id of the originating `query` frame).
    QueryId
);

branded_id!(
    /// Owning user of a session. Taken from the verified token subject.
    UserId
);

impl ConnectionId {
    /// Mint a fresh, time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7().simple()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

static SESSION_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9\-_]{8,64}$").expect("session id pattern is valid")
});

/// Client-chosen conversation identifier, `^[a-zA-Z0-9\-_]{8,64}$`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a session id.
    pub fn parse(raw: &str) -> Option<Self> {
        SESSION_ID_PATTERN
            .is_match(raw)
            .then(|| Self(raw.to_owned()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid session id: {raw:?}")))
    }
}

impl std::ops::Deref for SessionId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
