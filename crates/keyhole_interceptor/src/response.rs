//! Synthetic response construction (§4.9's final step): turn an
//! [`IpcResponse`] back into the shape the agent's call site expects —
//! status, headers, and a decoded body — regardless of whether the wire
//! carried it as text or Base64.

use keyhole_ipc::{BodyEncoding, IpcResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("sidecar returned an error: {0}")]
    Sidecar(String),
    #[error("sidecar response body was not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// A decoded response body, ready to hand back to the agent's call site.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Text(String),
    Binary(Vec<u8>),
}

/// The agent-facing synthetic response object (§4.9: "a synthetic response
/// object that carries status, headers, and body").
#[derive(Debug, Clone)]
pub struct SyntheticResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl SyntheticResponse {
    /// Decode a raw [`IpcResponse`] into a [`SyntheticResponse`].
    ///
    /// A sidecar-level `error` field (request rejected before reaching
    /// upstream — unknown service, missing secret, auth failure) surfaces
    /// as `Err` so the interceptor can decide whether to raise it to the
    /// agent as a thrown error rather than a normal HTTP response.
    pub fn from_ipc(resp: IpcResponse) -> Result<Self, ResponseError> {
        if let Some(message) = resp.error {
            return Err(ResponseError::Sidecar(message));
        }
        let body = match resp.body {
            None => ResponseBody::Text(String::new()),
            Some(raw) => match resp.body_encoding {
                BodyEncoding::Text => ResponseBody::Text(raw),
                BodyEncoding::Base64 => ResponseBody::Binary(keyhole_common::from_base64(&raw)?),
            },
        };
        Ok(Self {
            status: resp.status,
            headers: resp.headers.into_iter().collect(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn decodes_text_body() {
        let resp = IpcResponse {
            id: "1".into(),
            status: 200,
            headers: BTreeMap::new(),
            body: Some("hello".into()),
            body_encoding: BodyEncoding::Text,
            error: None,
            redacted: None,
        };
        let synthetic = SyntheticResponse::from_ipc(resp).unwrap();
        assert_eq!(synthetic.status, 200);
        assert!(matches!(synthetic.body, ResponseBody::Text(s) if s == "hello"));
    }

    #[test]
    fn decodes_base64_body() {
        let encoded = keyhole_common::to_base64(b"\x00\x01binary");
        let resp = IpcResponse {
            id: "1".into(),
            status: 200,
            headers: BTreeMap::new(),
            body: Some(encoded),
            body_encoding: BodyEncoding::Base64,
            error: None,
            redacted: None,
        };
        let synthetic = SyntheticResponse::from_ipc(resp).unwrap();
        assert!(matches!(synthetic.body, ResponseBody::Binary(b) if b == b"\x00\x01binary"));
    }

    #[test]
    fn sidecar_error_surfaces_as_err() {
        let resp = IpcResponse::error("1", 404, "unknown service");
        let err = SyntheticResponse::from_ipc(resp).unwrap_err();
        assert!(matches!(err, ResponseError::Sidecar(msg) if msg == "unknown service"));
    }
}
