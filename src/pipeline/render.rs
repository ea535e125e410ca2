//! Page rasterisation: PDF pages → `DynamicImage` via pdfium.
//!
//! [`PageRasterizer`] is the seam the assembler talks to; [`PdfiumRasterizer`]
//! is the production implementation. pdfium is a blocking C++ library with
//! thread-local state, so every call runs on the `spawn_blocking` pool and
//! binds its own `Pdfium` instance there.
//!
//! Pages are rendered at `render_scale` × their natural size, capped at
//! `max_rendered_pixels` on either edge. The planner then cuts the result
//! into strips, so the effective resolution per model call is higher than a
//! full-page render at the same cap.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::DocumentMetadata;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One rasterised page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-indexed page number.
    pub page_num: usize,
    pub image: DynamicImage,
}

impl PageImage {
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Source of page images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Open the document and read its metadata (including the page count).
    async fn inspect(&self, path: &Path, password: Option<&str>) -> Result<DocumentMetadata, ExtractError>;

    /// Render the given 0-indexed pages, in the order given.
    async fn render(
        &self,
        path: &Path,
        password: Option<&str>,
        page_indices: &[usize],
    ) -> Result<Vec<PageImage>, ExtractError>;
}

/// pdfium-backed rasteriser.
///
/// The library is looked up in `PDFIUM_LIB_PATH` (a file or a directory),
/// then next to the working directory, then system-wide.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    render_scale: f32,
    max_pixels: u32,
    library_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(render_scale: f32, max_pixels: u32) -> Self {
        Self {
            render_scale,
            max_pixels,
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(config.render_scale, config.max_rendered_pixels)
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }
}

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn inspect(&self, path: &Path, password: Option<&str>) -> Result<DocumentMetadata, ExtractError> {
        let path = path.to_path_buf();
        let password = password.map(str::to_string);
        let library = self.library_path.clone();

        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium(library.as_deref())?;
            let document = open_document(&pdfium, &path, password.as_deref())?;
            Ok(read_metadata(&document))
        })
        .await
        .map_err(|e| ExtractError::Internal(format!("Metadata task panicked: {e}")))?
    }

    async fn render(
        &self,
        path: &Path,
        password: Option<&str>,
        page_indices: &[usize],
    ) -> Result<Vec<PageImage>, ExtractError> {
        let path = path.to_path_buf();
        let password = password.map(str::to_string);
        let library = self.library_path.clone();
        let indices = page_indices.to_vec();
        let (scale, max_pixels) = (self.render_scale, self.max_pixels);

        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium(library.as_deref())?;
            let document = open_document(&pdfium, &path, password.as_deref())?;
            render_blocking(&document, &indices, scale, max_pixels)
        })
        .await
        .map_err(|e| ExtractError::Internal(format!("Render task panicked: {e}")))?
    }
}

fn bind_pdfium(library: Option<&Path>) -> Result<Pdfium, ExtractError> {
    let bindings = match library {
        Some(p) if p.is_dir() => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p)),
        Some(p) => Pdfium::bind_to_library(p),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")),
    }
    .or_else(|_| Pdfium::bind_to_system_library())
    .map_err(|e| ExtractError::RasterizerUnavailable(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, ExtractError> {
    pdfium
        .load_pdf_from_file(path, password)
        .map_err(|e| classify_load_error(path, password.is_some(), &format!("{e:?}")))
}

/// Map a pdfium load failure to the matching load error.
fn classify_load_error(path: &Path, had_password: bool, detail: &str) -> ExtractError {
    let path = path.to_path_buf();
    if detail.to_lowercase().contains("password") {
        if had_password {
            ExtractError::WrongPassword { path }
        } else {
            ExtractError::PasswordRequired { path }
        }
    } else {
        ExtractError::CorruptPdf {
            path,
            detail: detail.to_string(),
        }
    }
}

fn render_blocking(
    document: &PdfDocument<'_>,
    indices: &[usize],
    scale: f32,
    max_pixels: u32,
) -> Result<Vec<PageImage>, ExtractError> {
    let pages = document.pages();
    let total = pages.len() as usize;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut out = Vec::with_capacity(indices.len());
    for &idx in indices {
        if idx >= total {
            return Err(ExtractError::PageOutOfRange {
                page: idx + 1,
                total,
            });
        }
        let failed = |e: PdfiumError| ExtractError::RasterisationFailed {
            page: idx + 1,
            detail: format!("{e:?}"),
        };

        let page = pages.get(idx as u16).map_err(failed)?;
        let image = page.render_with_config(&render_config).map_err(failed)?.as_image();
        debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());

        out.push(PageImage {
            page_num: idx + 1,
            image,
        });
    }
    Ok(out)
}

fn read_metadata(document: &PdfDocument<'_>) -> DocumentMetadata {
    let metadata = document.metadata();
    let get = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata
            .get(tag)
            .map(|t| t.value().trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let page_count = document.pages().len() as usize;
    info!("PDF loaded: {} pages", page_count);

    DocumentMetadata {
        title: get(PdfDocumentMetadataTagType::Title),
        author: get(PdfDocumentMetadataTagType::Author),
        subject: get(PdfDocumentMetadataTagType::Subject),
        creator: get(PdfDocumentMetadataTagType::Creator),
        producer: get(PdfDocumentMetadataTagType::Producer),
        page_count,
        pdf_version: format!("{:?}", document.version()),
    }
}
