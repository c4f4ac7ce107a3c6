pub mod config;
mod errors;
pub mod process;
pub mod session;
pub mod storage;
pub mod upload;
pub mod validate;

pub use config::EditorConfig;
pub use errors::{
    FieldError, FieldErrors, ProfileError, Result, SessionError, UploadFailure,
};
pub use process::{ImageProcessor, Preview, ProcessedAsset};
pub use session::{ProfileSession, SessionState, SubmitOutcome};
pub use storage::{JsonFileStore, KeyValueStore};
pub use upload::{BlobUploader, ProgressReporter, UploadEvent, UploadResult};
pub use validate::{validate, ImageAsset, ImageOrigin, ImageType};

use std::sync::Arc;

use once_cell::sync::OnceCell;
use upload::SignedUrlSource;

pub const KILOBYTE: u64 = 1024;
pub const MEGABYTE: u64 = 1024 * KILOBYTE;

pub const STORAGE_LABEL: &str = "profile-editor";

static LOGGER: OnceCell<()> = OnceCell::new();

/// Set up diagnostic logging once per process. Honours `RUST_LOG`.
pub fn initialize() {
    LOGGER.get_or_init(|| {
        let _ = env_logger::builder().is_test(cfg!(test)).try_init();
    });
}

/// Open the session persisted at `config.storage_path`, uploading through
/// `client` in `config.upload_chunk_size` pieces into the containers that
/// `signer` hands out.
pub fn open_session(
    config: EditorConfig,
    client: reqwest::Client,
    signer: Arc<dyn SignedUrlSource>,
) -> ProfileSession<JsonFileStore> {
    let uploader =
        BlobUploader::http(client, config.upload_chunk_size, signer);
    open_session_with(config, uploader)
}

/// Like `open_session`, with a caller-built uploader.
pub fn open_session_with(
    config: EditorConfig,
    uploader: BlobUploader,
) -> ProfileSession<JsonFileStore> {
    let store =
        JsonFileStore::open(STORAGE_LABEL.to_owned(), &config.storage_path);
    ProfileSession::open(config, store, uploader)
}
