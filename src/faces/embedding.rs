//! Face embedding vectors and their portable byte encoding.
//!
//! Embeddings are stored as a little-endian `f32` array with no header; the
//! dimension is kept in a separate column next to the blob.

use serde::{Deserialize, Serialize};

use crate::error::{IntakeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(IntakeError::InvalidEmbedding("empty vector".to_string()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(IntakeError::InvalidEmbedding("non-finite component".to_string()));
        }
        Ok(Self(values))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 4);
        for &val in &self.0 {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(IntakeError::InvalidEmbedding(format!(
                "blob length {} is not a multiple of 4",
                bytes.len()
            )));
        }

        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Self::new(values)
    }

    /// Euclidean distance; `None` when dimensions differ.
    pub fn distance(&self, other: &Embedding) -> Option<f32> {
        if self.0.len() != other.0.len() {
            return None;
        }

        let sum: f32 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();

        Some(sum.sqrt())
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = IntakeError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.0
    }
}
