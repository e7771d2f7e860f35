//! Tunnel failure taxonomy.

use http::StatusCode;
use thiserror::Error;

use super::inner::InnerRequestError;
use crate::http::codec::ProtocolVersion;
use crate::http::response::HijackError;
use crate::transport::{BoxError, DispatchError};

/// Every way a tunnel can fail. All of them are terminal for the tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed tunnel request: {0}")]
    MalformedTunnelRequest(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(ProtocolVersion),

    #[error("hijack failed: {0}")]
    HijackFailure(#[source] HijackError),

    #[error("failed to read inner request: {0}")]
    InnerRequestParseFailure(#[from] InnerRequestError),

    #[error("outbound dispatch failed: {0}")]
    OutboundDispatchFailure(#[from] DispatchError),

    #[error("failed to serialize upstream response: {0}")]
    ResponseSerializationFailure(#[source] BoxError),

    #[error("failed to write to client: {0}")]
    ResponseWriteFailure(#[source] std::io::Error),
}

impl TunnelError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedTunnelRequest(_) => "malformed_request",
            Self::UnsupportedProtocolVersion(_) => "unsupported_version",
            Self::HijackFailure(_) => "hijack_failure",
            Self::InnerRequestParseFailure(_) => "inner_parse_failure",
            Self::OutboundDispatchFailure(_) => "dispatch_failure",
            Self::ResponseSerializationFailure(_) => "serialization_failure",
            Self::ResponseWriteFailure(_) => "write_failure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedTunnelRequest(_) | Self::UnsupportedProtocolVersion(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body of the error reply sent to the client, if one is sent at all.
    ///
    /// A failed write to the client gets no reply: the socket is already broken.
    pub fn client_message(&self) -> Option<&'static str> {
        match self {
            Self::MalformedTunnelRequest(_) => Some("Bad Request\n"),
            Self::UnsupportedProtocolVersion(_) => Some("Unsupported protocol version."),
            Self::HijackFailure(_) => Some("Can't hijack client connection\n"),
            Self::InnerRequestParseFailure(_) => Some("Server Read Error\n"),
            Self::OutboundDispatchFailure(_) => Some("Server Request Error\n"),
            Self::ResponseSerializationFailure(_) => Some("Server Dump Error\n"),
            Self::ResponseWriteFailure(_) => None,
        }
    }

    /// Whether the failure happened after the socket left the structured response path.
    pub fn is_post_hijack(&self) -> bool {
        matches!(
            self,
            Self::InnerRequestParseFailure(_)
                | Self::OutboundDispatchFailure(_)
                | Self::ResponseSerializationFailure(_)
                | Self::ResponseWriteFailure(_)
        )
    }
}
