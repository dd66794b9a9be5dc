use anyhow::{Context, Result};
use async_trait::async_trait;
use learntrail_schemas::{Activity, ActivityMetadata};
use std::path::Path;
use tracing::debug;

use crate::enrich::{file_extension, language_for_extension};

const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;
const DEFAULT_MAX_CHARS: usize = 16_000;

const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "rst", "org", "adoc", "csv", "json", "toml", "yaml", "yml", "ipynb",
];

/// Text pulled out of an activity's source, plus metadata to merge into the row.
#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    pub text: String,
    pub metadata: Option<ActivityMetadata>,
}

/// Per-format content extraction (file text, OCR, transcripts).
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, activity: &Activity) -> Result<Option<ExtractedContent>>;
}

/// Reads plain-text and source files straight from `file_path`.
pub struct FileContentExtractor {
    max_file_bytes: u64,
    max_chars: usize,
}

impl Default for FileContentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FileContentExtractor {
    pub fn new() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }

    pub fn with_limits(mut self, max_file_bytes: u64, max_chars: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self.max_chars = max_chars.max(1);
        self
    }

    fn readable(path: &Path) -> bool {
        path.to_str()
            .and_then(file_extension)
            .map(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()) || language_for_extension(&ext).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContentExtractor for FileContentExtractor {
    async fn extract(&self, activity: &Activity) -> Result<Option<ExtractedContent>> {
        let Some(path) = activity.file_path.as_deref().map(Path::new) else {
            return Ok(None);
        };
        if !Self::readable(path) {
            debug!("No text extractor for {}", path.display());
            return Ok(None);
        }

        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if size > self.max_file_bytes {
            debug!("Skipping {} ({} bytes)", path.display(), size);
            return Ok(None);
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let char_count = raw.chars().count();
        let truncated = char_count > self.max_chars;
        let text: String = raw.chars().take(self.max_chars).collect();
        if text.trim().is_empty() {
            return Ok(None);
        }

        let mut metadata = ActivityMetadata::default();
        metadata.extra.insert("content_source".to_string(), "file".to_string());
        metadata.extra.insert("content_chars".to_string(), char_count.to_string());
        if truncated {
            metadata.extra.insert("content_truncated".to_string(), "true".to_string());
        }

        Ok(Some(ExtractedContent {
            text,
            metadata: Some(metadata),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use learntrail_schemas::{generate_activity_id, ActivityContent, ActivityType, Classification};
    use std::io::Write;
    use tempfile::Builder;

    fn reading(path: &Path) -> Activity {
        Activity {
            id: generate_activity_id(),
            source_type: None,
            activity_type: ActivityType::Reading,
            app_name: "Zed".into(),
            title: "notes".into(),
            content: ActivityContent::Pending,
            url: None,
            file_path: Some(path.to_string_lossy().into_owned()),
            project_name: None,
            video_id: None,
            game_name: None,
            session_id: None,
            classification: Classification::Learning,
            confidence: 0.7,
            timestamp: Utc::now(),
            metadata: ActivityMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_reads_text_files_with_char_cap() {
        let mut file = Builder::new().suffix(".md").tempfile().unwrap();
        write!(file, "# Lifetimes\nBorrowed values must outlive their references.").unwrap();

        let extractor = FileContentExtractor::new().with_limits(1024, 11);
        let content = extractor.extract(&reading(file.path())).await.unwrap().unwrap();

        assert_eq!(content.text, "# Lifetimes");
        let extra = content.metadata.unwrap().extra;
        assert_eq!(extra.get("content_truncated").map(String::as_str), Some("true"));
        assert_eq!(extra.get("content_source").map(String::as_str), Some("file"));
    }

    #[tokio::test]
    async fn test_skips_binary_large_and_pathless() {
        let extractor = FileContentExtractor::new().with_limits(8, 100);

        let pdf = Builder::new().suffix(".pdf").tempfile().unwrap();
        assert!(extractor.extract(&reading(pdf.path())).await.unwrap().is_none());

        let mut big = Builder::new().suffix(".rs").tempfile().unwrap();
        write!(big, "fn main() {{}}").unwrap();
        assert!(extractor.extract(&reading(big.path())).await.unwrap().is_none());

        let mut pathless = reading(pdf.path());
        pathless.file_path = None;
        assert!(extractor.extract(&pathless).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let extractor = FileContentExtractor::new();
        let gone = reading(Path::new("/nonexistent/learntrail/notes.md"));
        assert!(extractor.extract(&gone).await.is_err());
    }
}
