//! Request body handling for the agent side of §4.9: a 10 MiB cap on
//! fetch-style bodies handed over in one call, and a size-capped
//! accumulator for stream-style request objects that write chunks over
//! time before the call is finalized.

use thiserror::Error;

/// Matches the interceptor-side cap named in §4.9 ("enforce a 10 MiB body
/// limit client-side").
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("request body exceeds the {MAX_BODY_BYTES}-byte limit")]
pub struct BodyTooLarge;

/// Choose the wire encoding for a finalized body (§4.9: "text if a
/// text-ish `Content-Type` or string body, else Base64 — byte-sniff
/// fallback when there is no content type").
pub fn is_text_ish_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("x-www-form-urlencoded")
        }
        None => false,
    }
}

/// Accumulates chunks from a stream-style request object, enforcing the
/// size cap as chunks arrive rather than only at the end. Used by write
/// sinks/pipes (§4.9: "Write-side supports piping — acts as a byte sink").
#[derive(Debug, Default)]
pub struct BodyAccumulator {
    buf: Vec<u8>,
    aborted: bool,
}

impl BodyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, rejecting it (and leaving prior content untouched)
    /// if it would push the buffer past [`MAX_BODY_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), BodyTooLarge> {
        if self.buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(BodyTooLarge);
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// `abort()`/`destroy()` (§4.9): cancel the request without ever
    /// sending an IPC request for it.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.buf.clear();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the accumulator and choose the wire body shape, sniffing
    /// the first bytes for UTF-8 validity when no `Content-Type` decided
    /// it as text already.
    pub fn finalize(self, content_type: Option<&str>) -> FinalizedBody {
        if is_text_ish_content_type(content_type) {
            if let Ok(text) = String::from_utf8(self.buf.clone()) {
                return FinalizedBody::Text(text);
            }
        }
        match String::from_utf8(self.buf) {
            Ok(text) => FinalizedBody::Text(text),
            Err(e) => FinalizedBody::Binary(e.into_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizedBody {
    Text(String),
    Binary(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_once_cap_exceeded() {
        let mut acc = BodyAccumulator::new();
        assert!(acc.push(&vec![0u8; MAX_BODY_BYTES]).is_ok());
        assert_eq!(acc.push(&[1]), Err(BodyTooLarge));
    }

    #[test]
    fn abort_clears_buffer_and_marks_aborted() {
        let mut acc = BodyAccumulator::new();
        acc.push(b"partial").unwrap();
        acc.abort();
        assert!(acc.is_aborted());
        assert!(acc.is_empty());
    }

    #[test]
    fn finalize_prefers_text_for_json_content_type() {
        let mut acc = BodyAccumulator::new();
        acc.push(b"{\"a\":1}").unwrap();
        let body = acc.finalize(Some("application/json"));
        assert_eq!(body, FinalizedBody::Text("{\"a\":1}".to_string()));
    }

    #[test]
    fn finalize_byte_sniffs_without_content_type() {
        let mut acc = BodyAccumulator::new();
        acc.push(&[0xff, 0xfe, 0x00, 0x01]).unwrap();
        let body = acc.finalize(None);
        assert!(matches!(body, FinalizedBody::Binary(_)));
    }

    #[test]
    fn finalize_treats_plain_string_body_as_text_even_without_content_type() {
        let mut acc = BodyAccumulator::new();
        acc.push(b"plain text").unwrap();
        let body = acc.finalize(None);
        assert_eq!(body, FinalizedBody::Text("plain text".to_string()));
    }
}
