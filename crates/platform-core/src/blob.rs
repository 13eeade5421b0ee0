//! Binary media payloads handed between the capture core, the UI layer
//! and the transcoder.

use std::fmt;
use std::sync::Arc;

/// An immutable chunk of media bytes tagged with its media type.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    data: Arc<[u8]>,
    mime_type: String,
}

impl Blob {
    pub fn new(data: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Concatenate recorder chunks into one blob.
    pub fn from_chunks(chunks: &[Vec<u8>], mime_type: impl Into<String>) -> Self {
        let data: Vec<u8> = chunks.concat();
        Self::new(data, mime_type)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Whether the media type carries sound only.
    pub fn is_audio_only(&self) -> bool {
        self.mime_type.trim_start().starts_with("audio/")
    }

    /// File extension implied by the media type, without codec parameters.
    pub fn extension(&self) -> &'static str {
        let essence = self
            .mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        match essence {
            "video/mp4" | "audio/mp4" => "mp4",
            "video/webm" | "audio/webm" => "webm",
            "video/x-matroska" => "mkv",
            "video/x-yuv4mpeg" => "y4m",
            "audio/wav" | "audio/x-wav" => "wav",
            "image/gif" => "gif",
            _ => "bin",
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("size", &self.data.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_ignores_codec_parameters() {
        let blob = Blob::new(vec![0u8; 4], "video/webm;codecs=vp8,opus");
        assert_eq!(blob.extension(), "webm");
        assert_eq!(blob.size(), 4);
        assert!(!blob.is_audio_only());
        assert!(Blob::new(vec![0u8; 4], "audio/wav").is_audio_only());
    }

    #[test]
    fn from_chunks_concatenates_in_order() {
        let blob = Blob::from_chunks(&[vec![1, 2], vec![], vec![3]], "video/x-yuv4mpeg");
        assert_eq!(blob.bytes(), &[1, 2, 3]);
        assert_eq!(blob.extension(), "y4m");
    }
}
