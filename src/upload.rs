use std::fmt;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Body;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use url::Url;

use crate::process::ProcessedAsset;
use crate::storage::profile::unix_millis;
use crate::{FieldError, ProfileError, Result, UploadFailure, KILOBYTE};

/// Header telling blob storage what kind of blob the body becomes
pub const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
pub const BLOB_TYPE: &str = "BlockBlob";

const DEFAULT_CHUNK_SIZE: usize = 64 * KILOBYTE as usize;

/// A container endpoint that already carries its signed authorization
/// query string.
///
/// The query string is opaque here: it is forwarded untouched and never
/// printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedContainer {
    url: Url,
}

impl SignedContainer {
    pub fn new(url: Url) -> Result<Self> {
        if url.cannot_be_a_base()
            || !matches!(url.scheme(), "http" | "https")
        {
            return Err(ProfileError::Parse);
        }
        Ok(Self { url })
    }

    pub fn parse(url: &str) -> Result<Self> {
        Self::new(Url::parse(url)?)
    }

    /// Address of `blob_name` inside the container, signature included
    pub fn destination(&self, blob_name: &str) -> Result<Url> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| ProfileError::Parse)?
            .pop_if_empty()
            .push(blob_name);
        Ok(url)
    }
}

impl fmt::Debug for SignedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedContainer")
            .field("url", &public_url(&self.url).as_str())
            .finish()
    }
}

/// `url` without its query string and fragment
pub fn public_url(url: &Url) -> Url {
    let mut public = url.clone();
    public.set_query(None);
    public.set_fragment(None);
    public
}

/// Collision-resistant object name: upload time in milliseconds followed
/// by the original file name with whitespace runs replaced by `-`.
pub fn blob_name(file_name: &str, now: SystemTime) -> String {
    let sanitized = file_name.split_whitespace().collect::<Vec<_>>().join("-");
    let sanitized = if sanitized.is_empty() {
        "avatar".to_owned()
    } else {
        sanitized
    };
    format!("{}-{}", unix_millis(now), sanitized)
}

/// Hands out the signed container URL uploads go to.
#[async_trait]
pub trait SignedUrlSource: Send + Sync {
    async fn signed_container(&self) -> Result<SignedContainer>;
}

/// A container URL supplied at start-up.
#[derive(Debug, Clone)]
pub struct StaticSignedUrl(SignedContainer);

impl StaticSignedUrl {
    pub fn new(container: SignedContainer) -> Self {
        Self(container)
    }
}

#[async_trait]
impl SignedUrlSource for StaticSignedUrl {
    async fn signed_container(&self) -> Result<SignedContainer> {
        Ok(self.0.clone())
    }
}

/// Fetches a fresh container URL, as plain text, from a trusted issuing
/// service before every upload.
#[derive(Debug, Clone)]
pub struct IssuerSignedUrl {
    client: reqwest::Client,
    endpoint: Url,
}

impl IssuerSignedUrl {
    pub fn new(endpoint: Url) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl SignedUrlSource for IssuerSignedUrl {
    async fn signed_container(&self) -> Result<SignedContainer> {
        log::debug!("requesting signed container from {}", self.endpoint);
        let body = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        SignedContainer::parse(body.trim())
    }
}

/// What happened to an upload so far.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Percentage of the body handed to the connection, never decreasing
    Progress(u8),
    Completed(UploadResult),
    /// Nothing was sent because the committed image is still current
    Reused(Url),
    Failed(UploadFailure),
}

/// Publishes upload progress to an optional observer.
///
/// Clones share the same high-water mark, so percentages stay monotonic no
/// matter which clone reports them.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Option<UnboundedSender<UploadEvent>>,
    last: Arc<AtomicI16>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::silent()
    }
}

impl ProgressReporter {
    /// Reporter plus the stream of events it produces. The stream ends
    /// with `Completed`, `Reused` or `Failed`.
    pub fn channel() -> (Self, UnboundedReceiver<UploadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = Self {
            sender: Some(sender),
            last: Arc::new(AtomicI16::new(-1)),
        };
        (reporter, receiver)
    }

    /// Reporter nobody listens to
    pub fn silent() -> Self {
        Self {
            sender: None,
            last: Arc::new(AtomicI16::new(-1)),
        }
    }

    pub fn report(&self, sent: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        self.percent(percent);
    }

    pub fn last_percent(&self) -> Option<u8> {
        let last = self.last.load(Ordering::SeqCst);
        u8::try_from(last).ok()
    }

    pub(crate) fn complete(&self, result: &UploadResult) {
        self.percent(100);
        self.send(UploadEvent::Completed(result.clone()));
    }

    pub(crate) fn reused(&self, url: &Url) {
        self.send(UploadEvent::Reused(url.clone()));
    }

    pub(crate) fn fail(&self, failure: &UploadFailure) {
        self.send(UploadEvent::Failed(failure.clone()));
    }

    fn percent(&self, percent: u8) {
        let previous = self.last.fetch_max(percent as i16, Ordering::SeqCst);
        if (percent as i16) > previous {
            self.send(UploadEvent::Progress(percent));
        }
    }

    fn send(&self, event: UploadEvent) {
        if let Some(sender) = &self.sender {
            // a dropped receiver only means nobody is watching
            let _ = sender.send(event);
        }
    }
}

/// Moves bytes to a destination URL with a single PUT.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Returns the HTTP status the storage answered with.
    async fn put_blob(
        &self,
        destination: &Url,
        content_type: &str,
        body: Vec<u8>,
        progress: &ProgressReporter,
    ) -> std::result::Result<u16, UploadFailure>;
}

/// `BlobTransport` over reqwest. The body is streamed in chunks so that
/// progress follows what the connection has consumed.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    chunk_size: usize,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), DEFAULT_CHUNK_SIZE)
    }
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl BlobTransport for HttpTransport {
    async fn put_blob(
        &self,
        destination: &Url,
        content_type: &str,
        body: Vec<u8>,
        progress: &ProgressReporter,
    ) -> std::result::Result<u16, UploadFailure> {
        let body = Bytes::from(body);
        let len = body.len();
        let total = len as u64;

        // chunks are views into the one buffer
        let reporter = progress.clone();
        let starts = (0..len).step_by(self.chunk_size);
        let chunk_size = self.chunk_size;
        let stream = futures::stream::iter(starts).map(move |start| {
            let end = (start + chunk_size).min(len);
            reporter.report(end as u64, total);
            Ok::<_, std::io::Error>(body.slice(start..end))
        });

        let response = self
            .client
            .put(destination.clone())
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, total.to_string())
            .header(BLOB_TYPE_HEADER, BLOB_TYPE)
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| UploadFailure::Transport(e.to_string()))?;

        Ok(response.status().as_u16())
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    /// Public address of the blob, without the signature
    pub url: Url,
    pub blob_name: String,
    /// Seconds from transport start to resolution, one decimal
    pub duration_secs: f64,
    pub original_size: u64,
    pub uploaded_size: u64,
}

/// Uploads processed avatars into the container handed out by a
/// `SignedUrlSource`.
#[derive(Clone)]
pub struct BlobUploader {
    transport: Arc<dyn BlobTransport>,
    source: Arc<dyn SignedUrlSource>,
}

impl BlobUploader {
    pub fn new(
        transport: Arc<dyn BlobTransport>,
        source: Arc<dyn SignedUrlSource>,
    ) -> Self {
        Self { transport, source }
    }

    /// Upload through `client`, streaming bodies in `chunk_size` pieces
    pub fn http(
        client: reqwest::Client,
        chunk_size: usize,
        source: Arc<dyn SignedUrlSource>,
    ) -> Self {
        Self::new(Arc::new(HttpTransport::new(client, chunk_size)), source)
    }

    /// Upload `asset`, resolving only on status 200 or 201.
    ///
    /// There is no cancellation and no timeout beyond the transport's own.
    pub async fn upload(
        &self,
        asset: &ProcessedAsset,
        progress: &ProgressReporter,
    ) -> std::result::Result<UploadResult, FieldError> {
        match self.try_upload(asset, progress).await {
            Ok(result) => {
                progress.complete(&result);
                Ok(result)
            }
            Err(failure) => {
                log::warn!("upload of {} failed: {}", asset.name, failure);
                progress.fail(&failure);
                Err(FieldError::UploadFailed(failure))
            }
        }
    }

    async fn try_upload(
        &self,
        asset: &ProcessedAsset,
        progress: &ProgressReporter,
    ) -> std::result::Result<UploadResult, UploadFailure> {
        let container = self
            .source
            .signed_container()
            .await
            .map_err(|e| UploadFailure::Transport(e.to_string()))?;
        let blob_name = blob_name(&asset.name, SystemTime::now());
        let destination = container
            .destination(&blob_name)
            .map_err(|e| UploadFailure::Transport(e.to_string()))?;
        let url = public_url(&destination);

        log::info!("uploading {} bytes to {}", asset.len(), url);
        progress.report(0, asset.len());

        let started = Instant::now();
        let status = self
            .transport
            .put_blob(&destination, asset.mime(), asset.bytes.clone(), progress)
            .await?;
        let elapsed = started.elapsed();

        if status != 200 && status != 201 {
            return Err(UploadFailure::Status(status));
        }

        let duration_secs = (elapsed.as_secs_f64() * 10.0).round() / 10.0;
        log::info!("uploaded {} in {:.1}s", url, duration_secs);
        Ok(UploadResult {
            url,
            blob_name,
            duration_secs,
            original_size: asset.original_size,
            uploaded_size: asset.len(),
        })
    }
}
