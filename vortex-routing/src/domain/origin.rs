//! Origin server models.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for an origin within its backend service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(pub String);

impl OriginId {
    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for OriginId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single physical upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// The unique id of the origin.
    pub id: OriginId,
    /// Id of the backend service the origin belongs to.
    #[serde(default)]
    pub app_id: String,
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Origin {
    /// Create a new origin.
    pub fn new(
        app_id: impl Into<String>,
        id: impl Into<OriginId>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            app_id: app_id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, as used for the `Host` header and for connecting.
    pub fn host_and_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.app_id, self.id, self.host_and_port())
    }
}
