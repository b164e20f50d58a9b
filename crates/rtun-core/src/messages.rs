//! Control and proxy channel message catalog.
//!
//! Every frame carries an envelope `{"Type": <tag>, "Payload": {...}}`. Field
//! names on the wire are PascalCase; unknown fields are ignored and missing
//! fields take their default so older and newer servers stay compatible.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol version announced in `Auth`.
pub const PROTOCOL_VERSION: &str = "2";

/// Major/minor software version announced in `Auth` (informational only).
pub const MM_VERSION: &str = "1.7";

/// Envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    // Client -> server
    Auth,
    ReqTunnel,
    RegProxy,
    Ping,

    // Server -> client
    AuthResp,
    NewTunnel,
    ReqProxy,
    StartProxy,
    Pong,
}

impl MsgType {
    /// The tag as it appears in the envelope's `Type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "Auth",
            Self::ReqTunnel => "ReqTunnel",
            Self::RegProxy => "RegProxy",
            Self::Ping => "Ping",
            Self::AuthResp => "AuthResp",
            Self::NewTunnel => "NewTunnel",
            Self::ReqProxy => "ReqProxy",
            Self::StartProxy => "StartProxy",
            Self::Pong => "Pong",
        }
    }

    /// Whether this tag is sent by the client (as opposed to the server).
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Auth | Self::ReqTunnel | Self::RegProxy | Self::Ping)
    }
}

impl FromStr for MsgType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "Auth" => Ok(Self::Auth),
            "ReqTunnel" => Ok(Self::ReqTunnel),
            "RegProxy" => Ok(Self::RegProxy),
            "Ping" => Ok(Self::Ping),
            "AuthResp" => Ok(Self::AuthResp),
            "NewTunnel" => Ok(Self::NewTunnel),
            "ReqProxy" => Ok(Self::ReqProxy),
            "StartProxy" => Ok(Self::StartProxy),
            "Pong" => Ok(Self::Pong),
            _ => Err(format!("unknown message type: {s:?}")),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel protocols this client can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Parse a protocol name as sent by the server. Unknown names yield
    /// `None` so callers can skip them.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    /// Whether the local service behind this protocol speaks TLS.
    pub fn local_tls(&self) -> bool {
        matches!(self, Self::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Auth {
    pub version: String,
    pub mm_version: String,
    pub user: String,
    pub password: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub arch: String,
    /// Empty for new sessions.
    pub client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReqTunnel {
    pub req_id: String,
    pub protocol: String,

    // http/https only
    pub hostname: String,
    pub subdomain: String,
    pub http_auth: String,

    // tcp only
    pub remote_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegProxy {
    pub client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

// ── Response payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthResp {
    pub version: String,
    pub mm_version: String,
    pub client_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewTunnel {
    pub req_id: String,
    pub url: String,
    pub protocol: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqProxy {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartProxy {
    /// Public URL the relayed connection arrived on.
    pub url: String,
    pub client_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

/// A decoded envelope: one variant per catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth(Auth),
    ReqTunnel(ReqTunnel),
    RegProxy(RegProxy),
    Ping(Ping),
    AuthResp(AuthResp),
    NewTunnel(NewTunnel),
    ReqProxy(ReqProxy),
    StartProxy(StartProxy),
    Pong(Pong),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Auth(_) => MsgType::Auth,
            Self::ReqTunnel(_) => MsgType::ReqTunnel,
            Self::RegProxy(_) => MsgType::RegProxy,
            Self::Ping(_) => MsgType::Ping,
            Self::AuthResp(_) => MsgType::AuthResp,
            Self::NewTunnel(_) => MsgType::NewTunnel,
            Self::ReqProxy(_) => MsgType::ReqProxy,
            Self::StartProxy(_) => MsgType::StartProxy,
            Self::Pong(_) => MsgType::Pong,
        }
    }
}
