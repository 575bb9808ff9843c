//! Exchange roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the exchange an identity belongs to.
///
/// Role names double as registry row keys and default key-provider tags,
/// so the string forms are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The side that opens an exchange and judges the response.
    Initiator,

    /// The side that validates requests and produces signed responses.
    Responder,
}

impl Role {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }

    /// The opposite side of the exchange.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
