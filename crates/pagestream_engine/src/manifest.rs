use std::path::{Path, PathBuf};

use pagestream_core::{CrawlResult, StreamResult, UploadResult};
use serde::Serialize;
use serde_json::json;

use crate::persist::{AtomicFileWriter, PersistError};

pub const MANIFEST_FILENAME: &str = "pagestream-manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Batch results that can be summarised in a manifest.
pub trait BatchSummary: Serialize {
    fn kind(&self) -> &'static str;
    fn url_count(&self) -> usize;
    fn succeeded(&self) -> usize;
    fn session_id(&self) -> Option<&str> {
        None
    }
}

impl BatchSummary for CrawlResult {
    fn kind(&self) -> &'static str {
        "crawl"
    }

    fn url_count(&self) -> usize {
        self.len()
    }

    fn succeeded(&self) -> usize {
        self.success_count()
    }
}

impl BatchSummary for StreamResult {
    fn kind(&self) -> &'static str {
        "stream"
    }

    fn url_count(&self) -> usize {
        self.len()
    }

    fn succeeded(&self) -> usize {
        self.success_count()
    }

    fn session_id(&self) -> Option<&str> {
        Some(self.session().as_str())
    }
}

impl BatchSummary for UploadResult {
    fn kind(&self) -> &'static str {
        "upload"
    }

    fn url_count(&self) -> usize {
        self.len()
    }

    fn succeeded(&self) -> usize {
        self.success_count()
    }

    fn session_id(&self) -> Option<&str> {
        Some(self.uuid().as_str())
    }
}

/// Writes `pagestream-manifest.json` into `dir`, replacing any previous one.
pub fn write_manifest<T: BatchSummary>(
    dir: &Path,
    result: &T,
    generated_utc: &str,
) -> Result<PathBuf, ManifestError> {
    let manifest = json!({
        "kind": result.kind(),
        "generated_utc": generated_utc,
        "session": result.session_id(),
        "url_count": result.url_count(),
        "succeeded": result.succeeded(),
        "failed": result.url_count() - result.succeeded(),
        "results": result,
    });
    let body = serde_json::to_vec_pretty(&manifest)?;
    let path = AtomicFileWriter::new(dir).write(MANIFEST_FILENAME, &body)?;
    Ok(path)
}
