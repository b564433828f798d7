//! STUN/TURN server descriptors handed to the peer transport

use serde::{Deserialize, Serialize};

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// A STUN or TURN server the transport may consult during ICE gathering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A server that needs no credentials (typically STUN)
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// A TURN relay with long-term credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }
}

/// Public STUN plus the community TURN fallbacks
pub fn default_ice_servers() -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = DEFAULT_STUN_SERVERS
        .iter()
        .map(|url| IceServer::stun(*url))
        .collect();
    servers.push(IceServer::turn(
        "turn:numb.viagenie.ca",
        "webrtc@live.com",
        "muazkh",
    ));
    servers.push(IceServer::turn("turn:relay.backups.cz", "webrtc", "webrtc"));
    servers.push(IceServer::turn(
        "turn:relay.backups.cz?transport=tcp",
        "webrtc",
        "webrtc",
    ));
    servers
}
