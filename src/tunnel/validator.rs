//! Outer CONNECT request validation.
//!
//! Runs before the socket is hijacked, so every rejection can still be
//! answered through the structured response path.

use super::error::TunnelError;
use crate::http::request::InboundRequest;

/// Accept only `CONNECT` over HTTP/1.x with a usable target.
pub fn validate(request: &InboundRequest) -> Result<(), TunnelError> {
    let is_connect = request.is_connect();
    let major = request.version.major;
    let target = &request.target;

    let bad_target = (target.host.is_empty() || (target.scheme.is_empty() && !is_connect)) && major < 2;
    let missing_host = request.host().is_empty() && major == 2;
    if bad_target || missing_host {
        tracing::debug!(
            remote_addr = %request.remote_addr,
            method = %request.method,
            url = %target,
            "Rejected request without usable target"
        );
        return Err(TunnelError::MalformedTunnelRequest(format!("unusable target '{target}'")));
    }

    tracing::info!(
        remote_addr = %request.remote_addr,
        protocol = %request.version,
        method = %request.method,
        url = %target,
        "Tunnel request"
    );

    if !is_connect {
        return Err(TunnelError::MalformedTunnelRequest(format!(
            "method {} is not CONNECT",
            request.method
        )));
    }
    if major != 1 {
        tracing::error!(
            remote_addr = %request.remote_addr,
            protocol = %request.version,
            "Unsupported protocol version"
        );
        return Err(TunnelError::UnsupportedProtocolVersion(request.version));
    }
    Ok(())
}
