//! # Rate Control
//!
//! Closed-loop searches that drive a lossy encoder onto a byte-size budget.
//!
//! Two searches live here:
//!
//! - [`RateController`]: a bounded hill-climb over the video bitrate. It seeds
//!   the bitrate from the byte budget, re-encodes, and nudges the bitrate by a
//!   gap-dependent step until the output lands in the tolerance band just
//!   below the ceiling.
//! - [`QualityBudget`]: the still-image counterpart. It lowers a lossy quality
//!   parameter by a fixed step until the file fits.
//!
//! Both are generic over an async encoder trait and observe a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) between
//! encode attempts, never in the middle of one.

use thiserror::Error;

mod bitrate;
mod quality;

pub use bitrate::{
    BitrateEncoder, EncodeAttempt, EncodeTarget, RateController, RateOutcome, RateRun,
    step_for_gap,
};
pub use quality::{QualityBudget, QualityEncoder, QualityOutcome};

/// Errors raised while driving an encoder.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The encoder reported a failure for this attempt.
    #[error("{0}")]
    Encoder(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid encode target: {0}")]
    InvalidTarget(String),
}

impl EncodeError {
    pub fn encoder(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Encoder(err.into())
    }
}
