use std::fmt;
use std::path::Path;

use crate::FieldError;

/// Image formats accepted by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Jpeg,
    Png,
}

impl ImageType {
    /// Only exact matches of the declared MIME type are accepted.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn as_mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// How the file reached the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    Selected,
    Dropped,
}

/// A candidate avatar exactly as the user provided it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub origin: ImageOrigin,
}

impl ImageAsset {
    pub fn new<N, M>(
        name: N,
        mime: M,
        bytes: Vec<u8>,
        origin: ImageOrigin,
    ) -> Self
    where
        N: Into<String>,
        M: Into<String>,
    {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
            origin,
        }
    }

    /// Read a file from disk, taking the declared type from the caller
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        mime: &str,
        origin: ImageOrigin,
    ) -> crate::Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let name = path
            .as_ref()
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} has no usable file name",
                    path.as_ref().display()
                )
            })?
            .to_owned();
        Ok(Self::new(name, mime, bytes, origin))
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Check an incoming file before any processing happens.
///
/// The size ceiling is checked first, so oversized files are reported as
/// `TooLarge` whatever their declared type.
pub fn validate(
    asset: &ImageAsset,
    max_bytes: u64,
) -> Result<ImageType, FieldError> {
    if asset.len() > max_bytes {
        log::debug!(
            "rejecting {}: {} bytes exceeds {}",
            asset.name,
            asset.len(),
            max_bytes
        );
        return Err(FieldError::TooLarge {
            size: asset.len(),
            limit: max_bytes,
        });
    }

    ImageType::from_mime(&asset.mime).ok_or_else(|| {
        log::debug!(
            "rejecting {}: unsupported type {}",
            asset.name,
            asset.mime
        );
        FieldError::UnsupportedType(asset.mime.clone())
    })
}
