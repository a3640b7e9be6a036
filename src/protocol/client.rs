//! Authenticated request execution against the fixed numeric endpoints.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::auth::{DeviceCredential, TokenCache};
use super::error::ProtocolError;
use super::transport::{maybe_gunzip, RpcResponse, StreamResponse, Transport};
use crate::mapper::{parse_library_update, LibraryPage};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::wire::fields::{commit, download, hash_lookup, state_request, trash};
use crate::wire::{Message, MessageBuilder};

/// Fixed endpoint paths. The operation identifiers are opaque numbers; the
/// service exposes nothing more descriptive.
pub mod endpoints {
    pub const RPC_BASE: &str = "https://photosdata-pa.googleapis.com";
    pub const APP_PATH: &str = "6439526531001121323";

    pub const LIBRARY_STATE: &str = "18047484249733410717";
    pub const FIND_BY_HASH: &str = "5084965799730810217";
    pub const COMMIT_UPLOAD: &str = "16538846908252377752";
    pub const TRASH: &str = "17490284929287180316";

    pub const UPLOAD: &str = "https://photos.googleapis.com/data/upload/uploadmedia/interactive";
    pub const PREPARE_DOWNLOAD: &str = "https://photosdata-pa.googleapis.com/$rpc/social.frontend.photos.preparedownloaddata.v1.PhotosPrepareDownloadDataService/PhotosPrepareDownload";

    pub fn rpc(operation: &str) -> String {
        format!("{RPC_BASE}/{APP_PATH}/{operation}")
    }
}

const USER_AGENT_RPC: &str =
    "com.google.android.apps.photos/49029607 (Linux; U; Android 9; en_US; Pixel 3; Build/PQ2A.190205.001; Cronet/127.0.6533.2)";
const USER_AGENT_DOWNLOAD: &str = "AndroidDownloadManager/13";

/// Opaque extension headers the service expects on binary RPCs.
const EXT_HEADERS: [(&str, &str); 2] = [
    ("x-goog-ext-173412678-bin", "CgcIAhClARgC"),
    ("x-goog-ext-174067345-bin", "CgIIAg=="),
];

/// Retry-After values outside this range are clamped.
const RETRY_AFTER_MIN_SECS: u64 = 5;
const RETRY_AFTER_MAX_SECS: u64 = 60;

#[derive(Clone, Copy)]
enum Method {
    Post,
    Put,
}

/// Client for the private binary protocol.
///
/// Owns the token cache and the retry policy; every operation is an
/// authenticated POST of an opaque payload, gzip-aware on response decode.
pub struct ProtocolClient {
    transport: Arc<dyn Transport>,
    tokens: TokenCache,
    retry: RetryConfig,
}

impl ProtocolClient {
    pub fn new(transport: Arc<dyn Transport>, credential: DeviceCredential) -> Self {
        let tokens = TokenCache::new(transport.clone(), credential);
        Self {
            transport,
            tokens,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// One authenticated request. A rejected bearer token is refreshed and
    /// the request replayed once, internally; a second rejection surfaces
    /// as a client error.
    async fn request_once(
        &self,
        method: Method,
        url: &str,
        extra_headers: &[(String, String)],
        payload: Bytes,
    ) -> Result<RpcResponse, ProtocolError> {
        let mut refreshed = false;
        loop {
            let token = self.tokens.token().await?;
            let mut headers = vec![
                ("Authorization".to_string(), format!("Bearer {token}")),
                ("User-Agent".to_string(), USER_AGENT_RPC.to_string()),
            ];
            headers.extend_from_slice(extra_headers);

            let resp = match method {
                Method::Post => self.transport.post(url, &headers, payload.clone()).await?,
                Method::Put => self.transport.put(url, &headers, payload.clone()).await?,
            };

            match resp.status {
                200 | 206 => return Ok(resp),
                401 | 403 if !refreshed => {
                    debug!(status = resp.status, "bearer token rejected, refreshing");
                    self.tokens.invalidate().await;
                    refreshed = true;
                }
                404 => return Err(ProtocolError::NotFound),
                429 => {
                    return Err(ProtocolError::RateLimited {
                        retry_after: parse_retry_after(resp.header("retry-after")),
                    })
                }
                status if status >= 500 => return Err(ProtocolError::Server { status }),
                status => return Err(ProtocolError::Client { status }),
            }
        }
    }

    /// Binary RPC with retry; returns the decompressed response body.
    async fn rpc(
        &self,
        url: &str,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ProtocolError> {
        let payload = Bytes::from(payload);
        let headers = proto_headers();
        let resp = retry_with_backoff(&self.retry, cancel, || {
            self.request_once(Method::Post, url, &headers, payload.clone())
        })
        .await?;
        maybe_gunzip(resp.header("content-encoding"), &resp.body)
    }

    /// Fetch one page of library state. Empty `state_token` means "from the
    /// beginning"; a non-empty `page_token` resumes pagination.
    pub async fn fetch_library_page(
        &self,
        state_token: &str,
        page_token: &str,
        cancel: &CancellationToken,
    ) -> Result<LibraryPage, ProtocolError> {
        let mut b = MessageBuilder::new();
        b.nested(state_request::BODY, |body| {
            if !page_token.is_empty() {
                body.str(state_request::PAGE_TOKEN, page_token);
            }
            if !state_token.is_empty() {
                body.str(state_request::STATE_TOKEN, state_token);
            }
        });

        let body = self
            .rpc(&endpoints::rpc(endpoints::LIBRARY_STATE), b.finish(), cancel)
            .await?;
        parse_library_update(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Look up an existing media item by its raw content hash. Returns the
    /// media key when the library already holds those bytes.
    pub async fn find_by_hash(
        &self,
        hash: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProtocolError> {
        let mut b = MessageBuilder::new();
        b.nested(hash_lookup::BODY, |body| {
            body.nested(hash_lookup::QUERY, |q| {
                q.bytes(hash_lookup::HASH_BYTES, hash);
            });
            body.nested(hash_lookup::OPTIONS, |_| {});
        });

        let body = match self
            .rpc(&endpoints::rpc(endpoints::FIND_BY_HASH), b.finish(), cancel)
            .await
        {
            Ok(body) => body,
            Err(ProtocolError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let msg =
            Message::decode(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(msg
            .message_at(&[
                hash_lookup::BODY,
                hash_lookup::RESULT,
                hash_lookup::RESULT_ITEM,
            ])
            .and_then(|m| m.str(hash_lookup::RESULT_MEDIA_KEY).map(str::to_string)))
    }

    /// Obtain an upload session token for a pending byte upload.
    pub async fn fetch_upload_token(
        &self,
        hash: &[u8],
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ProtocolError> {
        let mut b = MessageBuilder::new();
        b.varint(1, 2)
            .varint(2, 2)
            .varint(3, 1)
            .varint(4, 3)
            .varint(7, size);
        let payload = Bytes::from(b.finish());

        let headers = vec![
            (
                "Content-Type".to_string(),
                "application/x-protobuf".to_string(),
            ),
            ("X-Goog-Hash".to_string(), format!("sha1={}", STANDARD.encode(hash))),
            ("X-Upload-Content-Length".to_string(), size.to_string()),
        ];

        let resp = retry_with_backoff(&self.retry, cancel, || {
            self.request_once(Method::Post, endpoints::UPLOAD, &headers, payload.clone())
        })
        .await?;

        resp.header("x-guploader-uploadid")
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::Malformed("upload response missing session id".into()))
    }

    /// Upload the bytes for a session. The raw response body is the
    /// completion token consumed by [`Self::commit_upload`].
    pub async fn upload_bytes(
        &self,
        upload_token: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ProtocolError> {
        let url = format!("{}?upload_id={upload_token}", endpoints::UPLOAD);
        let headers = vec![(
            "Content-Type".to_string(),
            "application/octet-stream".to_string(),
        )];
        let resp = retry_with_backoff(&self.retry, cancel, || {
            self.request_once(Method::Put, &url, &headers, data.clone())
        })
        .await?;
        Ok(resp.body)
    }

    /// Commit an uploaded byte stream as a library item; returns the
    /// assigned media key.
    pub async fn commit_upload(
        &self,
        upload_response: &[u8],
        file_name: &str,
        hash: &[u8],
        timestamp_secs: i64,
        cancel: &CancellationToken,
    ) -> Result<String, ProtocolError> {
        let mut b = MessageBuilder::new();
        b.nested(commit::CONTENT, |content| {
            content.bytes(commit::UPLOAD_RESPONSE, upload_response);
            content.str(commit::FILE_NAME, file_name);
            content.bytes(commit::HASH_BYTES, hash);
            content.nested(commit::TIMESTAMP, |ts| {
                ts.varint(commit::TIMESTAMP_SECONDS, timestamp_secs as u64);
                ts.varint(commit::TIMESTAMP_NANOS, 46_000_000);
            });
            // Quality 3 commits at original quality.
            content.varint(commit::QUALITY, 3);
            content.varint(10, 1);
            content.varint(17, 0);
        });
        b.nested(commit::DEVICE, |device| {
            device.str(commit::DEVICE_MODEL, "Pixel 3");
            device.str(commit::DEVICE_MAKE, "Google");
            device.varint(commit::DEVICE_API_LEVEL, 28);
        });
        b.bytes(3, &[1, 3]);

        let body = self
            .rpc(&endpoints::rpc(endpoints::COMMIT_UPLOAD), b.finish(), cancel)
            .await?;
        let msg =
            Message::decode(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        msg.message_at(&[commit::RESPONSE_BODY, commit::RESPONSE_MEDIA])
            .and_then(|m| m.str(commit::RESPONSE_MEDIA_KEY).map(str::to_string))
            .or_else(|| {
                msg.message(commit::RESPONSE_BODY)
                    .and_then(|m| m.str(1).map(str::to_string))
            })
            .ok_or_else(|| ProtocolError::Malformed("commit response missing media key".into()))
    }

    /// Upload bytes as a new library item, deduplicating against content
    /// already in the library: a hash hit short-circuits the upload and
    /// returns the existing media key.
    pub async fn upload_media(
        &self,
        data: Bytes,
        file_name: &str,
        timestamp_secs: i64,
        cancel: &CancellationToken,
    ) -> Result<String, ProtocolError> {
        let hash = Sha1::digest(&data);

        if let Some(existing) = self.find_by_hash(&hash, cancel).await? {
            debug!(media_key = %existing, "content already in library, skipping upload");
            return Ok(existing);
        }

        let token = self
            .fetch_upload_token(&hash, data.len() as u64, cancel)
            .await?;
        let completion = self.upload_bytes(&token, data, cancel).await?;
        self.commit_upload(&completion, file_name, &hash, timestamp_secs, cancel)
            .await
    }

    /// Move items to the remote trash by dedup key.
    pub async fn trash_items(
        &self,
        dedup_keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError> {
        let mut b = MessageBuilder::new();
        b.varint(trash::ACTION, trash::ACTION_TRASH);
        for key in dedup_keys {
            match decode_dedup_key(key) {
                Some(raw) => {
                    b.bytes(trash::DEDUP_KEYS, &raw);
                }
                None => warn!(dedup_key = %key, "dedup key does not decode, skipping"),
            }
        }
        b.varint(trash::SCOPE, trash::SCOPE_ALL);
        b.nested(8, |f8| {
            f8.nested(4, |f84| {
                f84.str(2, "");
                f84.nested(3, |m| {
                    m.str(1, "");
                });
                f84.str(4, "");
                f84.nested(5, |m| {
                    m.str(1, "");
                });
            });
        });
        b.nested(9, |f9| {
            f9.varint(1, 5);
            f9.nested(2, |version| {
                version.varint(1, 51_079_550);
                version.str(2, "33");
            });
        });

        self.rpc(&endpoints::rpc(endpoints::TRASH), b.finish(), cancel)
            .await?;
        Ok(())
    }

    /// Resolve a time-limited download URL for a media key. A deleted item
    /// surfaces as [`ProtocolError::NotFound`].
    pub async fn fetch_download_url(
        &self,
        media_key: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProtocolError> {
        let mut b = MessageBuilder::new();
        b.nested(download::TARGET, |target| {
            target.nested(download::TARGET_KEY, |k| {
                k.str(download::KEY, media_key);
            });
        });
        b.nested(download::OPTIONS, |options| {
            options.nested(1, |o1| {
                o1.nested(7, |o17| {
                    o17.nested(2, |_| {});
                });
            });
            options.nested(5, |o5| {
                o5.nested(2, |_| {});
                o5.nested(3, |_| {});
                o5.nested(5, |o55| {
                    o55.nested(1, |_| {});
                    o55.varint(3, 0);
                });
            });
        });

        let body = self
            .rpc(endpoints::PREPARE_DOWNLOAD, b.finish(), cancel)
            .await?;
        let msg =
            Message::decode(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        for variant in [download::VARIANT_PRIMARY, download::VARIANT_FALLBACK] {
            if let Some(url) = msg
                .message_at(&[
                    download::RESPONSE_BODY,
                    download::VARIANTS,
                    variant,
                    download::URL_WRAPPER,
                ])
                .and_then(|m| m.str(download::URL).map(str::to_string))
            {
                return Ok(url);
            }
        }
        Err(ProtocolError::Malformed(
            "download response missing url".into(),
        ))
    }

    /// Open a plain GET stream against a resolved download URL. Transient
    /// statuses are retried; the stream itself is not resumed once started.
    pub async fn fetch_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamResponse, ProtocolError> {
        let headers = vec![(
            "User-Agent".to_string(),
            USER_AGENT_DOWNLOAD.to_string(),
        )];
        retry_with_backoff(&self.retry, cancel, || async {
            let resp = self.transport.get_stream(url, &headers).await?;
            match resp.status {
                200 | 206 => Ok(resp),
                404 => Err(ProtocolError::NotFound),
                429 => Err(ProtocolError::RateLimited { retry_after: None }),
                status if status >= 500 => Err(ProtocolError::Server { status }),
                status => Err(ProtocolError::Client { status }),
            }
        })
        .await
    }
}

fn proto_headers() -> Vec<(String, String)> {
    let mut headers = vec![(
        "Content-Type".to_string(),
        "application/x-protobuf".to_string(),
    )];
    for (k, v) in EXT_HEADERS {
        headers.push((k.to_string(), v.to_string()));
    }
    headers
}

fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.clamp(RETRY_AFTER_MIN_SECS, RETRY_AFTER_MAX_SECS)))
}

/// Dedup keys are stored URL-safe base64 encoded; the wire wants the raw
/// bytes. Accept both padded and unpadded forms.
fn decode_dedup_key(key: &str) -> Option<Vec<u8>> {
    URL_SAFE
        .decode(key)
        .or_else(|_| URL_SAFE_NO_PAD.decode(key))
        .ok()
}
