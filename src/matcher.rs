use std::fmt;

use ndarray::ArrayView1;

use crate::error::{Error, Result};
use crate::{storage::FaceDatabase, Embedding};

/// Default acceptance threshold on cosine similarity.
pub const DEFAULT_THRESHOLD: f32 = 0.55;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(label) => f.write_str(label),
            Identity::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Best cosine similarity found, 0.0 for an empty database.
    pub score: f32,
}

/// Nearest-neighbour lookup over unit embeddings.
///
/// A match is accepted when `score > threshold`. The older
/// "distance below tolerance" form maps to `threshold = 1 - tolerance`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    pub threshold: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl Matcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Like `new`, for thresholds taken from user input. NaN and values
    /// outside `[-1, 1]` are rejected.
    pub fn try_new(threshold: f32) -> Result<Self> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(Error::Validation(format!(
                "threshold {} outside [-1, 1]",
                threshold
            )));
        }
        Ok(Self::new(threshold))
    }

    pub fn match_embedding(&self, query: &Embedding, db: &FaceDatabase) -> MatchResult {
        self.match_view(query.view(), db)
    }

    /// Score `query` against every row at once and take the first maximum.
    pub fn match_view(&self, query: ArrayView1<'_, f32>, db: &FaceDatabase) -> MatchResult {
        if db.is_empty() || query.len() != facerec_vision::EMBEDDING_DIM {
            return MatchResult {
                identity: Identity::Unknown,
                score: 0.0,
            };
        }

        let sims = db.matrix().dot(&query);
        let (best, score) = sims
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bs), (i, s)| {
                if s > bs {
                    (i, s)
                } else {
                    (bi, bs)
                }
            });
        let score = score.clamp(-1.0, 1.0);

        let identity = if score > self.threshold {
            Identity::Known(db.labels()[best].clone())
        } else {
            Identity::Unknown
        };
        MatchResult { identity, score }
    }
}
