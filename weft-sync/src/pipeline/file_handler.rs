// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! File handling: download, gate, convert.
//!
//! Files are size-capped and extension-gated before download; converters are
//! pluggable per format. A gated or empty file is a skip, never an error:
//! the handler sets `should_skip` and the pipeline counts it. A 5xx while
//! downloading is an operational `DownloadFailure`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use weft_entities::FileEntity;

use crate::pipeline::PipelineError;
use crate::source::SourceError;

/// Download size cap.
pub const MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "md", "txt", "rst", "html", "htm", "csv", "json", "yaml", "yml", "toml", "xml", "pdf", "docx",
    "pptx", "xlsx", "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "rb", "sh",
];

/// What became of a file after the handler ran.
#[derive(Debug)]
pub enum FileOutcome {
    /// Markdown ready for chunking.
    Converted { markdown: String },
    /// Gated out; `should_skip` has been set on the entity.
    Skipped { reason: String },
}

/// Converts one downloaded file format to markdown.
///
/// Heavy converters (OCR for PDFs, headless office conversion) live behind
/// this trait as external collaborators; the built-in ones cover textual
/// formats.
#[async_trait]
pub trait FileConverter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn supports(&self, extension: &str, mime_type: Option<&str>) -> bool;

    async fn convert_to_markdown(&self, path: &Path) -> Result<String, PipelineError>;
}

/// Passes textual formats through unchanged.
pub struct PlainTextConverter;

#[async_trait]
impl FileConverter for PlainTextConverter {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn supports(&self, extension: &str, mime_type: Option<&str>) -> bool {
        matches!(
            extension,
            "md" | "txt" | "rst" | "html" | "htm" | "csv" | "json" | "yaml" | "yml" | "toml"
                | "xml" | "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "h" | "rb"
                | "sh"
        ) || mime_type.map(|mime| mime.starts_with("text/")).unwrap_or(false)
    }

    async fn convert_to_markdown(&self, path: &Path) -> Result<String, PipelineError> {
        tokio::fs::read_to_string(path).await.map_err(|error| {
            PipelineError::Conversion {
                converter: "plain_text",
                message: error.to_string(),
            }
        })
    }
}

pub struct FileProcessor {
    client: reqwest::Client,
    max_size_bytes: u64,
    allowed_extensions: Vec<String>,
    converters: Vec<Arc<dyn FileConverter>>,
}

impl Default for FileProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FileProcessor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_size_bytes: MAX_FILE_SIZE_BYTES,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|extension| extension.to_string())
                .collect(),
            converters: vec![Arc::new(PlainTextConverter)],
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn FileConverter>) -> Self {
        self.converters.push(converter);
        self
    }

    fn extension_of(file: &FileEntity) -> String {
        let from_name = file
            .common
            .name
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if !from_name.is_empty() && from_name != file.common.name.to_lowercase() {
            return from_name;
        }
        file.mime_type
            .as_deref()
            .and_then(|mime| mime_guess::get_mime_extensions_str(mime))
            .and_then(|extensions| extensions.first())
            .map(|extension| extension.to_string())
            .unwrap_or_default()
    }

    /// Downloads and converts a file entity, setting `local_path`,
    /// `total_size`, and `should_skip` as side effects.
    pub async fn fetch_and_convert(
        &self,
        file: &mut FileEntity,
        scratch_dir: &Path,
    ) -> Result<FileOutcome, SourceError> {
        let extension = Self::extension_of(file);
        if !self.allowed_extensions.contains(&extension) {
            file.should_skip = true;
            return Ok(FileOutcome::Skipped {
                reason: format!("extension `{extension}` is not ingestible"),
            });
        }

        let local_path = match &file.local_path {
            // Replay already materialized the file.
            Some(path) if path.is_file() => path.clone(),
            _ => self.download(file, scratch_dir).await?,
        };
        let total_size = tokio::fs::metadata(&local_path)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        file.total_size = Some(total_size);
        file.local_path = Some(local_path.clone());

        if total_size == 0 {
            file.should_skip = true;
            return Ok(FileOutcome::Skipped {
                reason: "downloaded file is empty".to_string(),
            });
        }
        if total_size > self.max_size_bytes {
            file.should_skip = true;
            return Ok(FileOutcome::Skipped {
                reason: format!("file is {total_size} bytes, over the {} cap", self.max_size_bytes),
            });
        }

        let Some(converter) = self
            .converters
            .iter()
            .find(|converter| converter.supports(&extension, file.mime_type.as_deref()))
        else {
            file.should_skip = true;
            return Ok(FileOutcome::Skipped {
                reason: format!("no converter for `{extension}`"),
            });
        };
        debug!(
            entity_id = %file.common.entity_id,
            converter = converter.name(),
            "converting-file"
        );
        match converter.convert_to_markdown(&local_path).await {
            Ok(markdown) => Ok(FileOutcome::Converted { markdown }),
            Err(error) => {
                // A file the converter cannot read is skipped, not fatal.
                warn!(entity_id = %file.common.entity_id, %error, "file-conversion-failed");
                file.should_skip = true;
                Ok(FileOutcome::Skipped {
                    reason: format!("conversion failed: {error}"),
                })
            }
        }
    }

    async fn download(
        &self,
        file: &FileEntity,
        scratch_dir: &Path,
    ) -> Result<PathBuf, SourceError> {
        let response = self
            .client
            .get(&file.download_url)
            .send()
            .await
            .map_err(|error| SourceError::DownloadFailure {
                url: file.download_url.clone(),
                message: error.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::DownloadFailure {
                url: file.download_url.clone(),
                message: format!("{status}"),
            });
        }
        if let Some(content_length) = response.content_length() {
            if content_length > self.max_size_bytes {
                // Don't pull an oversized body just to discard it.
                return Err(SourceError::FileSkipped {
                    reason: format!("declared size {content_length} over cap"),
                });
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|error| SourceError::DownloadFailure {
                url: file.download_url.clone(),
                message: error.to_string(),
            })?;
        let file_name = format!(
            "{}_{}",
            file.common.entity_id.replace(['/', '\\'], "_"),
            file.common.name.replace(['/', '\\'], "_")
        );
        let local_path = scratch_dir.join(file_name);
        tokio::fs::write(&local_path, &bytes)
            .await
            .map_err(|error| SourceError::DownloadFailure {
                url: file.download_url.clone(),
                message: format!("cannot write scratch file: {error}"),
            })?;
        Ok(local_path)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use weft_entities::EntityCommon;

    fn file_entity(name: &str, url: String) -> FileEntity {
        FileEntity {
            common: EntityCommon::new("F1", name, "drive.file"),
            download_url: url,
            mime_type: None,
            local_path: None,
            total_size: None,
            should_skip: false,
        }
    }

    #[tokio::test]
    async fn test_zero_byte_download_is_skipped_not_errored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::new()))
            .mount(&server)
            .await;
        let scratch = tempfile::tempdir().unwrap();
        let processor = FileProcessor::new();
        let mut file = file_entity("empty.txt", format!("{}/empty.txt", server.uri()));

        let outcome = processor.fetch_and_convert(&mut file, scratch.path()).await.unwrap();
        assert!(matches!(outcome, FileOutcome::Skipped { .. }));
        assert!(file.should_skip);
        assert_eq!(file.total_size, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_extension_is_gated_before_download() {
        let scratch = tempfile::tempdir().unwrap();
        let processor = FileProcessor::new();
        let mut file = file_entity("blob.exe", "http://127.0.0.1:1/never-called".to_string());
        let outcome = processor.fetch_and_convert(&mut file, scratch.path()).await.unwrap();
        assert!(matches!(outcome, FileOutcome::Skipped { .. }));
        assert!(file.should_skip);
        assert!(file.local_path.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_download_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.txt"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let scratch = tempfile::tempdir().unwrap();
        let processor = FileProcessor::new();
        let mut file = file_entity("doc.txt", format!("{}/doc.txt", server.uri()));
        let error = processor
            .fetch_and_convert(&mut file, scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(error, SourceError::DownloadFailure { .. }));
    }

    #[tokio::test]
    async fn test_text_file_converts_to_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/note.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# Jersey\nowned by Sam"))
            .mount(&server)
            .await;
        let scratch = tempfile::tempdir().unwrap();
        let processor = FileProcessor::new();
        let mut file = file_entity("note.md", format!("{}/note.md", server.uri()));
        let outcome = processor.fetch_and_convert(&mut file, scratch.path()).await.unwrap();
        match outcome {
            FileOutcome::Converted { markdown } => assert!(markdown.contains("owned by Sam")),
            other => panic!("expected conversion, got {other:?}"),
        }
        assert!(!file.should_skip);
        assert!(file.local_path.is_some());
        assert_eq!(file.total_size, Some("# Jersey\nowned by Sam".len() as u64));
    }

    #[tokio::test]
    async fn test_pre_materialized_file_skips_download() {
        let scratch = tempfile::tempdir().unwrap();
        let existing = scratch.path().join("restored.txt");
        tokio::fs::write(&existing, b"restored body").await.unwrap();
        let processor = FileProcessor::new();
        let mut file = file_entity("restored.txt", "http://127.0.0.1:1/never".to_string());
        file.local_path = Some(existing);
        let outcome = processor.fetch_and_convert(&mut file, scratch.path()).await.unwrap();
        assert!(matches!(outcome, FileOutcome::Converted { .. }));
    }
}
