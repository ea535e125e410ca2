//! Input resolution: turn the user-supplied path or URL into a local PDF.
//!
//! pdfium opens documents by path, so URLs are downloaded into a `TempDir`
//! that lives inside [`ResolvedInput`] and is removed when it is dropped.
//! Both branches check the `%PDF` magic before handing the file on, which
//! turns "you gave me a PNG" into a clear load error instead of a pdfium
//! parse failure.

use crate::error::ExtractError;
use futures::StreamExt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A local PDF ready to be rasterised.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// Downloaded copy; the directory is deleted on drop.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a local PDF, downloading it first if it is a URL.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, ExtractError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input))
    }
}

fn resolve_local(path: &Path) -> Result<ResolvedInput, ExtractError> {
    let path = path.to_path_buf();
    if !path.is_file() {
        return Err(ExtractError::FileNotFound { path });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractError::PermissionDenied { path });
        }
        Err(_) => return Err(ExtractError::FileNotFound { path }),
    };

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == PDF_MAGIC => {}
        Ok(()) => return Err(ExtractError::NotAPdf { path, magic }),
        Err(_) => {
            return Err(ExtractError::CorruptPdf {
                path,
                detail: "file is shorter than a PDF header".into(),
            })
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, ExtractError> {
    info!("Downloading PDF from {}", url);

    let failed = |reason: String| ExtractError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            ExtractError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(classify)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let temp_dir = TempDir::new().map_err(|e| ExtractError::Internal(format!("tempdir: {e}")))?;
    let path = temp_dir.path().join(filename_from_url(url));
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| ExtractError::Internal(format!("temp file: {e}")))?;

    // Stream to disk; the first four bytes are kept for the magic check.
    let mut head: Vec<u8> = Vec::with_capacity(4);
    let mut written = 0usize;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(classify)?;
        if head.len() < 4 {
            let take = (4 - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ExtractError::Internal(format!("temp file write: {e}")))?;
        written += chunk.len();
    }
    file.flush()
        .await
        .map_err(|e| ExtractError::Internal(format!("temp file flush: {e}")))?;

    if head.len() < 4 {
        return Err(failed(format!("response body too short ({written} bytes)")));
    }
    if head.as_slice() != PDF_MAGIC {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&head);
        return Err(ExtractError::NotAPdf { path, magic });
    }

    info!("Downloaded {} bytes to {}", written, path.display());
    Ok(ResolvedInput::Downloaded {
        path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
