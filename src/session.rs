use std::time::SystemTime;

use tokio::task::JoinHandle;
use url::Url;

use crate::config::EditorConfig;
use crate::process::{
    CompressionOptions, ImageProcessor, Preview, ProcessedAsset,
};
use crate::storage::{KeyValueStore, ProfileStore, StorageKey};
use crate::upload::{BlobUploader, ProgressReporter, UploadResult};
use crate::validate::{validate, ImageAsset, ImageType};
use crate::{FieldError, FieldErrors, SessionError};

pub const SUCCESS_MESSAGE: &str = "Profile saved successfully!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Read-only view of the committed profile
    Viewing,
    Editing,
    /// An upload is in flight; fields are locked
    Submitting,
}

/// User preferences persisted alongside the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorSettings {
    pub dark_theme: bool,
    pub compression_enabled: bool,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            dark_theme: false,
            compression_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeStats {
    pub original: u64,
    pub processed: u64,
}

/// The last successfully saved profile.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedProfile {
    pub name: String,
    pub bio: String,
    pub preview: Preview,
    pub upload_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Uploaded(UploadResult),
    /// Only text changed; the committed image URL was kept
    Reused(Url),
}

/// An accepted file whose processing is running on the blocking pool.
pub struct PendingImage {
    selection: u64,
    compress: bool,
    task: JoinHandle<Result<ProcessedAsset, FieldError>>,
}

/// One editing session of the profile widget.
///
/// The session owns every transient value (draft fields, processed image,
/// errors, progress) and mirrors committed values into `S`.
pub struct ProfileSession<S: KeyValueStore> {
    config: EditorConfig,
    store: ProfileStore<S>,
    processor: ImageProcessor,
    uploader: BlobUploader,

    state: SessionState,
    settings: EditorSettings,
    committed: CommittedProfile,

    name: String,
    bio: String,
    preview: Preview,
    processed: Option<ProcessedAsset>,
    selection: u64,

    errors: FieldErrors,
    progress: Option<u8>,
    sizes: Option<SizeStats>,
    upload_duration: Option<f64>,
    success: Option<String>,
}

impl<S: KeyValueStore> ProfileSession<S> {
    /// Restore the session from `store`, starting in `Viewing`.
    pub fn open(
        config: EditorConfig,
        store: S,
        uploader: BlobUploader,
    ) -> Self {
        let mut store = ProfileStore::new(store, config.success_ttl());
        let persisted = store.load(SystemTime::now());

        let defaults = EditorSettings::default();
        let settings = EditorSettings {
            dark_theme: persisted.dark_theme.unwrap_or(defaults.dark_theme),
            compression_enabled: persisted
                .compression_enabled
                .unwrap_or(defaults.compression_enabled),
        };
        let committed = CommittedProfile {
            name: persisted
                .name
                .unwrap_or_else(|| config.default_name.clone()),
            bio: persisted.bio.unwrap_or_else(|| config.default_bio.clone()),
            preview: persisted
                .preview
                .unwrap_or_else(|| Preview::url(config.default_avatar.clone())),
            upload_url: persisted.upload_url,
        };
        let sizes = match (persisted.original_size, persisted.compressed_size) {
            (Some(original), Some(processed)) => {
                Some(SizeStats { original, processed })
            }
            _ => None,
        };
        let processor = ImageProcessor::new(CompressionOptions {
            max_bytes: config.max_output_bytes,
            max_dimension: config.max_dimension,
        });

        log::debug!(
            "session opened, avatar committed: {}",
            committed.upload_url.is_some()
        );

        Self {
            store,
            processor,
            uploader,
            state: SessionState::Viewing,
            settings,
            name: committed.name.clone(),
            bio: committed.bio.clone(),
            preview: committed.preview.clone(),
            committed,
            processed: None,
            selection: 0,
            errors: FieldErrors::default(),
            progress: None,
            sizes,
            upload_duration: persisted.upload_duration,
            success: persisted.success.map(|notice| notice.message),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state == SessionState::Submitting
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bio(&self) -> &str {
        &self.bio
    }

    /// What the avatar slot currently shows
    pub fn preview(&self) -> &Preview {
        &self.preview
    }

    pub fn committed(&self) -> &CommittedProfile {
        &self.committed
    }

    pub fn processed(&self) -> Option<&ProcessedAsset> {
        self.processed.as_ref()
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn settings(&self) -> EditorSettings {
        self.settings
    }

    pub fn progress(&self) -> Option<u8> {
        self.progress
    }

    pub fn sizes(&self) -> Option<SizeStats> {
        self.sizes
    }

    pub fn upload_duration(&self) -> Option<f64> {
        self.upload_duration
    }

    pub fn success_message(&self) -> Option<&str> {
        self.success.as_deref()
    }

    pub fn store(&self) -> &S {
        self.store.inner()
    }

    /// Switch from `Viewing` to `Editing`, dropping leftovers of the
    /// previous edit. Already editing is a no-op.
    pub fn begin_editing(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Editing => Ok(()),
            SessionState::Submitting => Err(SessionError::Busy),
            SessionState::Viewing => {
                self.errors.clear();
                self.progress = None;
                self.sizes = None;
                self.upload_duration = None;
                self.state = SessionState::Editing;
                Ok(())
            }
        }
    }

    /// Leave `Editing` without saving, restoring the committed profile.
    pub fn cancel_editing(&mut self) -> Result<(), SessionError> {
        self.ensure_editing()?;
        self.name = self.committed.name.clone();
        self.bio = self.committed.bio.clone();
        self.preview = self.committed.preview.clone();
        self.processed = None;
        self.selection += 1;
        self.errors.clear();
        self.progress = None;
        self.sizes = None;
        self.state = SessionState::Viewing;
        Ok(())
    }

    pub fn set_name<N: Into<String>>(
        &mut self,
        name: N,
    ) -> Result<(), SessionError> {
        self.ensure_editing()?;
        self.name = name.into();
        self.errors.name = None;
        Ok(())
    }

    pub fn set_bio<B: Into<String>>(
        &mut self,
        bio: B,
    ) -> Result<(), SessionError> {
        self.ensure_editing()?;
        self.bio = bio.into();
        Ok(())
    }

    pub fn set_compression_enabled(&mut self, enabled: bool) {
        self.settings.compression_enabled = enabled;
        self.store.save(StorageKey::CompressionEnabled, &enabled);
    }

    pub fn set_dark_theme(&mut self, enabled: bool) {
        self.settings.dark_theme = enabled;
        self.store.save(StorageKey::DarkTheme, &enabled);
    }

    /// Validate and process a new avatar in one go.
    pub async fn select_image(
        &mut self,
        asset: ImageAsset,
    ) -> Result<(), SessionError> {
        let pending = self.accept_image(asset)?;
        self.finish_processing(pending).await
    }

    /// First stage of a selection: validate `asset`, show it right away
    /// and start processing in the background.
    ///
    /// An accepted file supersedes the previous processed image at once, so
    /// submitting before processing finishes never uploads the old one.
    /// A rejected file leaves preview, processed image and success message
    /// untouched. Must be called within a tokio runtime.
    pub fn accept_image(
        &mut self,
        asset: ImageAsset,
    ) -> Result<PendingImage, SessionError> {
        self.ensure_editing()?;
        let image_type: ImageType =
            match validate(&asset, self.config.max_input_bytes) {
                Ok(image_type) => image_type,
                Err(e) => {
                    self.errors.image = Some(e.clone());
                    return Err(SessionError::Field(e));
                }
            };

        self.errors.image = None;
        if self.success.take().is_some() {
            self.store.clear(StorageKey::SuccessMessage);
        }
        self.preview = ImageProcessor::optimistic_preview(&asset);
        self.processed = None;
        self.sizes = None;
        self.selection += 1;

        let processor = self.processor;
        let compress = self.settings.compression_enabled;
        let task = tokio::spawn(async move {
            processor.process(&asset, image_type, compress).await
        });
        Ok(PendingImage {
            selection: self.selection,
            compress,
            task,
        })
    }

    /// Second stage of a selection: swap the optimistic preview for the
    /// processed one, or fall back to the committed avatar on failure.
    ///
    /// Results of a selection that has since been superseded are dropped.
    pub async fn finish_processing(
        &mut self,
        pending: PendingImage,
    ) -> Result<(), SessionError> {
        let outcome = match pending.task.await {
            Ok(outcome) => outcome,
            Err(e) if pending.compress => {
                Err(FieldError::CompressionFailed(e.to_string()))
            }
            Err(e) => Err(FieldError::ProcessingFailed(e.to_string())),
        };

        if pending.selection != self.selection
            || self.state != SessionState::Editing
        {
            log::debug!("discarding superseded image selection");
            return Ok(());
        }

        match outcome {
            Ok(processed) => {
                self.sizes = Some(SizeStats {
                    original: processed.original_size,
                    processed: processed.len(),
                });
                self.preview = processed.preview.clone();
                self.processed = Some(processed);
                self.errors.image = None;
                Ok(())
            }
            Err(e) => {
                self.processed = None;
                self.sizes = None;
                self.preview = self.committed.preview.clone();
                self.errors.image = Some(e.clone());
                Err(SessionError::Field(e))
            }
        }
    }

    pub async fn submit(&mut self) -> Result<SubmitOutcome, SessionError> {
        self.submit_with_progress(&ProgressReporter::silent()).await
    }

    /// Save the profile, uploading the processed image if there is one.
    ///
    /// Without a new image the committed URL is reused and no transfer
    /// happens. On failure the session returns to `Editing` with every
    /// field value kept, so submitting again retries.
    pub async fn submit_with_progress(
        &mut self,
        progress: &ProgressReporter,
    ) -> Result<SubmitOutcome, SessionError> {
        match self.state {
            SessionState::Editing => {}
            SessionState::Submitting => return Err(SessionError::Busy),
            SessionState::Viewing => return Err(SessionError::NotEditing),
        }

        let mut missing = FieldErrors::default();
        if self.name.trim().is_empty() {
            missing.name = Some(FieldError::NameRequired);
        }
        if self.processed.is_none() && self.committed.upload_url.is_none() {
            missing.image = Some(FieldError::ImageRequired);
        }
        if !missing.is_empty() {
            if missing.name.is_some() {
                self.errors.name = missing.name.clone();
            }
            if missing.image.is_some() {
                self.errors.image = missing.image.clone();
            }
            return Err(SessionError::Invalid(missing));
        }

        self.errors.form = None;
        let outcome = match self.processed.clone() {
            Some(asset) => {
                self.state = SessionState::Submitting;
                self.progress = Some(0);
                let mut guard = SubmitGuard {
                    state: &mut self.state,
                    progress: &mut self.progress,
                    armed: true,
                };
                let uploaded = self.uploader.upload(&asset, progress).await;
                guard.armed = false;
                drop(guard);
                self.progress = progress.last_percent();

                match uploaded {
                    Ok(result) => {
                        self.commit_upload(&asset, &result);
                        SubmitOutcome::Uploaded(result)
                    }
                    Err(e) => {
                        self.state = SessionState::Editing;
                        self.progress = None;
                        self.errors.form = Some(e.clone());
                        return Err(SessionError::Field(e));
                    }
                }
            }
            None => {
                let url = match &self.committed.upload_url {
                    Some(url) => url.clone(),
                    None => {
                        return Err(SessionError::Invalid(FieldErrors {
                            image: Some(FieldError::ImageRequired),
                            ..FieldErrors::default()
                        }))
                    }
                };
                log::info!("image unchanged, reusing {}", url);
                progress.reused(&url);
                SubmitOutcome::Reused(url)
            }
        };

        self.commit_fields();
        self.success = Some(SUCCESS_MESSAGE.to_owned());
        self.store.save_success(SUCCESS_MESSAGE, SystemTime::now());
        self.progress = None;
        self.state = SessionState::Viewing;
        Ok(outcome)
    }

    /// Forget everything persisted and go back to the defaults.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::Busy);
        }
        self.store.reset();
        self.committed = CommittedProfile {
            name: self.config.default_name.clone(),
            bio: self.config.default_bio.clone(),
            preview: Preview::url(self.config.default_avatar.clone()),
            upload_url: None,
        };
        self.name = self.committed.name.clone();
        self.bio = self.committed.bio.clone();
        self.preview = self.committed.preview.clone();
        self.settings = EditorSettings::default();
        self.processed = None;
        self.selection += 1;
        self.errors.clear();
        self.progress = None;
        self.sizes = None;
        self.upload_duration = None;
        self.success = None;
        self.state = SessionState::Viewing;
        log::info!("profile reset to defaults");
        Ok(())
    }

    fn commit_upload(
        &mut self,
        asset: &ProcessedAsset,
        result: &UploadResult,
    ) {
        self.committed.preview = asset.preview.clone();
        self.committed.upload_url = Some(result.url.clone());
        self.preview = asset.preview.clone();
        self.processed = None;
        self.sizes = Some(SizeStats {
            original: result.original_size,
            processed: result.uploaded_size,
        });
        self.upload_duration = Some(result.duration_secs);

        self.store.save(StorageKey::Preview, &self.committed.preview);
        self.store.save(StorageKey::UploadUrl, &result.url);
        self.store
            .save(StorageKey::UploadDuration, &result.duration_secs);
        self.store.save(StorageKey::OriginalSize, &result.original_size);
        self.store
            .save(StorageKey::CompressedSize, &result.uploaded_size);
    }

    fn commit_fields(&mut self) {
        self.name = self.name.trim().to_owned();
        self.committed.name = self.name.clone();
        self.committed.bio = self.bio.clone();
        self.store.save(StorageKey::Name, &self.committed.name);
        self.store.save(StorageKey::Bio, &self.committed.bio);
    }

    fn ensure_editing(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Editing => Ok(()),
            SessionState::Submitting => Err(SessionError::Busy),
            SessionState::Viewing => Err(SessionError::NotEditing),
        }
    }
}

/// Puts the session back into `Editing` and hides progress if a submit
/// future is dropped while the upload is still pending.
struct SubmitGuard<'a> {
    state: &'a mut SessionState,
    progress: &'a mut Option<u8>,
    armed: bool,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("submit abandoned while uploading");
            *self.state = SessionState::Editing;
            *self.progress = None;
        }
    }
}
