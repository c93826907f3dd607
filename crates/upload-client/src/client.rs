//! Upload service client.
//!
//! Async HTTP client using `reqwest`. Entry bodies are streamed in chunks
//! so send progress can be reported while the request is in flight; file
//! bodies are read from disk as they are sent.

use std::collections::BTreeMap;
use std::io;

use bucketload_transfer::{
    EntryVerdict, ProgressCallback, ServiceFuture, TransferBody, TransferError, TransferRequest,
    UploadService,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{Response, StatusCode};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::wire;

/// Size of the slices an entry body is streamed in.
const CHUNK_SIZE: usize = 64 * 1024;

/// Errors from the upload client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ClientError> for TransferError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api { status, body } => TransferError::Server {
                status,
                message: body,
            },
            ClientError::Io(e) => TransferError::Io(e),
            other => TransferError::Transport(other.to_string()),
        }
    }
}

/// `reqwest`-backed [`UploadService`].
#[derive(Debug, Clone)]
pub struct HttpUploadService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadService {
    /// Creates a client for the server rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(http, base_url)
    }

    /// Uses a preconfigured `reqwest::Client` (proxies, timeouts, auth headers).
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, ClientError> {
        let parsed =
            reqwest::Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `PUT /upload/begin`. Returns the bucket ID from the response body.
    pub async fn begin(
        &self,
        upload_handler: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, ClientError> {
        let mut query: Vec<(&str, &str)> = vec![(wire::UPLOAD_HANDLER_PARAM, upload_handler)];
        query.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let resp = self
            .http
            .put(wire::begin_url(&self.base_url))
            .query(&query)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(api_error(resp).await);
        }

        let bucket_id = resp.text().await?.trim().to_string();
        debug!(handler = upload_handler, bucket = %bucket_id, "bucket allocated");
        Ok(bucket_id)
    }

    /// `GET /upload/{handler}/{path}?size=n`. Any status other than 200 is
    /// a rejection whose reason is the response text.
    pub async fn validate(
        &self,
        upload_handler: &str,
        path: &str,
        size: u64,
    ) -> Result<EntryVerdict, ClientError> {
        let resp = self
            .http
            .get(wire::validate_url(&self.base_url, upload_handler, path))
            .query(&[("size", size)])
            .send()
            .await?;
        if resp.status() == StatusCode::OK {
            return Ok(EntryVerdict::Accepted);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let reason = wire::error_message(&body, status_text(status));
        debug!(path, status = status.as_u16(), reason = %reason, "entry rejected");
        Ok(EntryVerdict::Rejected(reason))
    }

    /// `PUT /upload/{bucket}{target}{upload}?isDirectory=b`. Any 2xx status
    /// is success.
    pub async fn put_entry(
        &self,
        request: TransferRequest,
        progress: ProgressCallback,
    ) -> Result<(), ClientError> {
        let url = wire::transfer_url(
            &self.base_url,
            &request.bucket_id,
            &request.target_path,
            &request.upload_path,
        );
        let mut builder = self
            .http
            .put(url)
            .query(&[("isDirectory", request.is_directory)]);

        if !request.is_directory {
            let (len, body) = open_body(request.body, progress).await?;
            builder = builder.header(CONTENT_LENGTH, len).body(body);
        }

        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(())
    }

    /// `PUT /upload/{bucket}/commit`. Returns the `Location` header on
    /// 200, 201 or 204.
    pub async fn commit(&self, bucket_id: &str) -> Result<Option<String>, ClientError> {
        let resp = self
            .http
            .put(wire::commit_url(&self.base_url, bucket_id))
            .send()
            .await?;
        if !matches!(
            resp.status(),
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT
        ) {
            let err = api_error(resp).await;
            warn!(bucket = %bucket_id, error = %err, "commit refused");
            return Err(err);
        }

        Ok(resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

impl UploadService for HttpUploadService {
    fn begin_session<'a>(
        &'a self,
        upload_handler: &'a str,
        params: &'a BTreeMap<String, String>,
    ) -> ServiceFuture<'a, String> {
        Box::pin(async move { Ok(self.begin(upload_handler, params).await?) })
    }

    fn validate_entry<'a>(
        &'a self,
        upload_handler: &'a str,
        path: &'a str,
        size: u64,
    ) -> ServiceFuture<'a, EntryVerdict> {
        Box::pin(async move { Ok(self.validate(upload_handler, path, size).await?) })
    }

    fn transfer(
        &self,
        request: TransferRequest,
        progress: ProgressCallback,
    ) -> ServiceFuture<'_, ()> {
        Box::pin(async move { Ok(self.put_entry(request, progress).await?) })
    }

    fn commit_session<'a>(&'a self, bucket_id: &'a str) -> ServiceFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.commit(bucket_id).await?) })
    }
}

/// Turns a transfer body into a streamed request body and its length.
///
/// Files are opened here and read in [`CHUNK_SIZE`] blocks while the
/// request is sent. The length is taken from the open file and the read is
/// capped to it, so a file that grows mid-upload cannot overrun
/// `Content-Length`.
async fn open_body(
    body: TransferBody,
    progress: ProgressCallback,
) -> Result<(u64, reqwest::Body), ClientError> {
    match body {
        TransferBody::Empty => Ok((0, reqwest::Body::from(Bytes::new()))),
        TransferBody::Bytes(data) => {
            let len = data.len() as u64;
            let chunks: Vec<io::Result<Bytes>> = (0..data.len())
                .step_by(CHUNK_SIZE)
                .map(|start| Ok(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
                .collect();
            Ok((len, progress_body(futures_util::stream::iter(chunks), len, progress)))
        }
        TransferBody::File { path, size } => {
            let file = tokio::fs::File::open(&path).await?;
            let len = file.metadata().await?.len();
            if len != size {
                debug!(path = %path.display(), expected = size, actual = len, "file size changed since walk");
            }
            let chunks = ReaderStream::with_capacity(file.take(len), CHUNK_SIZE);
            Ok((len, progress_body(chunks, len, progress)))
        }
    }
}

/// Wraps a chunk stream, reporting cumulative bytes handed to the transport.
fn progress_body<S>(chunks: S, total: u64, progress: ProgressCallback) -> reqwest::Body
where
    S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
{
    let mut sent = 0u64;
    let stream = chunks.map(move |chunk| {
        if let Ok(chunk) = &chunk {
            sent += chunk.len() as u64;
            progress(sent, total);
        }
        chunk
    });
    reqwest::Body::wrap_stream(stream)
}

/// Drains a failed response into [`ClientError::Api`].
async fn api_error(resp: Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ClientError::Api {
        status: status.as_u16(),
        body: wire::error_message(&body, status_text(status)),
    }
}

fn status_text(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("unknown status")
}
