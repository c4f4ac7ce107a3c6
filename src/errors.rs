use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProfileError>;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parsing error")]
    Parse,
    #[error("Storage error: {0} {1}")]
    Storage(String, String),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for ProfileError {
    fn from(_: serde_json::Error) -> Self {
        Self::Parse
    }
}

/// Why an upload did not land in blob storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadFailure {
    #[error("storage responded with status {0}")]
    Status(u16),
    #[error("{0}")]
    Transport(String),
}

/// Errors scoped to a single field of the editor.
///
/// None of these end the session; each one blocks only the action that
/// produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("Only JPEG and PNG images are supported (got {0})")]
    UnsupportedType(String),
    #[error("Image is too large: {size} bytes (max {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },
    #[error("Image compression failed: {0}")]
    CompressionFailed(String),
    #[error("Image processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Name is required")]
    NameRequired,
    #[error("Profile image is required")]
    ImageRequired,
    #[error("Upload failed: {0}")]
    UploadFailed(UploadFailure),
}

/// Field-scoped errors currently shown next to the form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors {
    pub name: Option<FieldError>,
    pub image: Option<FieldError>,
    /// Form-level message, used for transport failures.
    pub form: Option<FieldError>,
}

impl FieldErrors {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.image.is_none() && self.form.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Why a session operation did not go through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Profile is not being edited")]
    NotEditing,
    #[error("An upload is already in progress")]
    Busy,
    #[error("Profile form is incomplete")]
    Invalid(FieldErrors),
    #[error(transparent)]
    Field(FieldError),
}
