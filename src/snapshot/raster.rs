//! SVG to PNG conversion through an external rendering service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::debug;

use super::source::PageSvg;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Raster request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Raster service returned {status} for page {page_id}")]
    Status { page_id: String, status: u16 },
}

#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize(&self, page_id: &str, svg: &str) -> Result<Bytes, RasterError>;
}

/// Posts each SVG as a multipart `svg` field and reads the PNG body back.
pub struct HttpRasterizer {
    url: String,
    client: reqwest::Client,
}

impl HttpRasterizer {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, RasterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Rasterizer for HttpRasterizer {
    async fn rasterize(&self, page_id: &str, svg: &str) -> Result<Bytes, RasterError> {
        let part = reqwest::multipart::Part::bytes(svg.as_bytes().to_vec())
            .file_name("image.svg")
            .mime_str("image/svg+xml")?;
        let form = reqwest::multipart::Form::new().part("svg", part);

        let resp = self.client.post(&self.url).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(RasterError::Status {
                page_id: page_id.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.bytes().await?)
    }
}

/// Rasterize `pages` with at most `width` conversions in flight. Output keeps
/// the input order; the first failure aborts the rest.
pub async fn rasterize_pages(
    rasterizer: Arc<dyn Rasterizer>,
    pages: Vec<PageSvg>,
    width: usize,
) -> Result<Vec<(String, Bytes)>, RasterError> {
    debug!(pages = pages.len(), width, "Rasterizing pages");
    stream::iter(pages)
        .map(|page| {
            let rasterizer = Arc::clone(&rasterizer);
            async move {
                let png = rasterizer.rasterize(&page.id, &page.svg).await?;
                Ok::<_, RasterError>((page.id, png))
            }
        })
        .buffered(width.max(1))
        .try_collect()
        .await
}
