//! Quality-step budget loop for still images.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::EncodeError;

/// An encoder driven by a lossy quality parameter (higher is better).
#[async_trait]
pub trait QualityEncoder: Send + Sync {
    /// Re-encode at `quality` and return the produced size in bytes.
    async fn encode(&self, quality: u8) -> Result<u64, EncodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityOutcome {
    /// The file fits. `quality` is `None` when no re-encode was needed.
    WithinBudget { size_bytes: u64, quality: Option<u8> },
    /// Quality reached zero and the file is still too large.
    Unsatisfiable { last_size_bytes: u64 },
    Cancelled,
}

/// Lowers quality by a fixed step until the output fits `max_size_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityBudget {
    pub max_size_bytes: u64,
    pub start_quality: u8,
    pub quality_step: u8,
}

impl Default for QualityBudget {
    fn default() -> Self {
        Self {
            max_size_bytes: 512 * 1024,
            start_quality: 98,
            quality_step: 5,
        }
    }
}

impl QualityBudget {
    pub async fn run<E>(
        &self,
        encoder: &E,
        initial_size_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<QualityOutcome, EncodeError>
    where
        E: QualityEncoder + ?Sized,
    {
        if self.quality_step == 0 {
            return Err(EncodeError::InvalidTarget(
                "quality_step must be positive".to_string(),
            ));
        }

        let mut size_bytes = initial_size_bytes;
        let mut quality = i32::from(self.start_quality);
        let mut used = None;

        while size_bytes > self.max_size_bytes {
            if cancel.is_cancelled() {
                return Ok(QualityOutcome::Cancelled);
            }
            if quality <= 0 {
                warn!(size_bytes, "Quality exhausted, image still over budget");
                return Ok(QualityOutcome::Unsatisfiable {
                    last_size_bytes: size_bytes,
                });
            }

            let q = quality as u8;
            size_bytes = encoder.encode(q).await?;
            used = Some(q);
            debug!(quality = q, size_bytes, "Re-encoded still image");
            quality -= i32::from(self.quality_step);
        }

        Ok(QualityOutcome::WithinBudget {
            size_bytes,
            quality: used,
        })
    }
}
