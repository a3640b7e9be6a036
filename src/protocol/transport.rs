//! Object-safe HTTP seam.
//!
//! All network traffic goes through [`Transport`] so tests can substitute
//! scripted responses. The real implementation is a blanket impl for
//! `reqwest::Client`.

use std::io::Read as _;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures_util::{Stream, TryStreamExt};

use super::error::ProtocolError;

/// Streaming response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A fully-buffered RPC response.
#[derive(Debug)]
pub struct RpcResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RpcResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A streaming download response.
pub struct StreamResponse {
    pub status: u16,
    /// Content-Length when the server reports one.
    pub content_length: Option<u64>,
    /// URL after redirects, reusable for subsequent requests.
    pub final_url: String,
    pub body: ByteStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<RpcResponse, ProtocolError>;

    async fn put(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<RpcResponse, ProtocolError>;

    async fn get_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<StreamResponse, ProtocolError>;
}

async fn buffered(resp: reqwest::Response) -> Result<RpcResponse, ProtocolError> {
    let status = resp.status().as_u16();
    let headers = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = resp.bytes().await?;
    Ok(RpcResponse {
        status,
        headers,
        body,
    })
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<RpcResponse, ProtocolError> {
        let mut req = reqwest::Client::post(self, url).body(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        buffered(req.send().await?).await
    }

    async fn put(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<RpcResponse, ProtocolError> {
        let mut req = reqwest::Client::put(self, url).body(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        buffered(req.send().await?).await
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<StreamResponse, ProtocolError> {
        let mut req = reqwest::Client::get(self, url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let final_url = resp.url().to_string();
        let body: ByteStream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(StreamResponse {
            status,
            content_length,
            final_url,
            body,
        })
    }
}

/// Decompress a response body when it is gzipped.
///
/// The server gzips some bodies regardless of negotiated encoding, so this
/// checks both the Content-Encoding header and the gzip magic bytes.
pub fn maybe_gunzip(content_encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let gzipped = content_encoding
        .map(|e| e.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
        || body.starts_with(&[0x1f, 0x8b]);
    if !gzipped {
        return Ok(body.to_vec());
    }
    let mut out = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Malformed(format!("gzip decode: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn plain_body_passes_through() {
        let body = b"plain".to_vec();
        assert_eq!(maybe_gunzip(None, &body).unwrap(), body);
    }

    #[test]
    fn gunzips_on_header() {
        let compressed = gzip(b"hello");
        assert_eq!(maybe_gunzip(Some("gzip"), &compressed).unwrap(), b"hello");
    }

    #[test]
    fn gunzips_on_magic_bytes_without_header() {
        let compressed = gzip(b"sniffed");
        assert_eq!(maybe_gunzip(None, &compressed).unwrap(), b"sniffed");
    }

    #[test]
    fn corrupt_gzip_is_malformed() {
        let err = maybe_gunzip(Some("gzip"), &[0x1f, 0x8b, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = RpcResponse {
            status: 200,
            headers: vec![("X-GUploader-UploadID".into(), "abc".into())],
            body: Bytes::new(),
        };
        assert_eq!(resp.header("x-guploader-uploadid"), Some("abc"));
        assert_eq!(resp.header("missing"), None);
    }
}
