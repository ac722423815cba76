use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DetectedFace, FaceExtractor};
use crate::db::BoundingBox;
use crate::faces::Embedding;

/// Client for an HTTP face-embedding service.
///
/// The service receives `{"image": <base64>}` and answers with
/// `{"faces": [{"top", "right", "bottom", "left", "embedding": [..]}]}`,
/// boxes in pixels of the submitted image.
pub struct HttpFaceExtractor {
    endpoint: String,
    timeout: Duration,
    expected_dim: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ExtractRequest {
    image: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    faces: Vec<ServiceFace>,
}

#[derive(Debug, Deserialize)]
struct ServiceFace {
    top: i32,
    right: i32,
    bottom: i32,
    left: i32,
    embedding: Vec<f32>,
}

impl HttpFaceExtractor {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs),
            expected_dim: None,
        }
    }

    /// Drop faces whose embedding length differs from `dim`.
    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.expected_dim = Some(dim);
        self
    }

    fn convert(&self, response: ExtractResponse) -> Vec<DetectedFace> {
        let mut faces = Vec::with_capacity(response.faces.len());
        for face in response.faces {
            if let Some(dim) = self.expected_dim {
                if face.embedding.len() != dim {
                    warn!(expected = dim, found = face.embedding.len(), "Skipping face with wrong embedding size");
                    continue;
                }
            }
            match Embedding::new(face.embedding) {
                Ok(embedding) => faces.push(DetectedFace {
                    bbox: BoundingBox::new(face.top, face.right, face.bottom, face.left),
                    embedding,
                }),
                Err(e) => warn!(error = %e, "Skipping face with invalid embedding"),
            }
        }
        faces
    }
}

impl FaceExtractor for HttpFaceExtractor {
    fn extract_faces(&self, path: &Path) -> Result<Vec<DetectedFace>> {
        let image_data = std::fs::read(path)?;
        let request = ExtractRequest {
            image: BASE64.encode(&image_data),
        };

        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();

        let response = agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(|e| anyhow!("Face service request failed: {}", e))?;

        let parsed: ExtractResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse face service response: {}", e))?;

        let faces = self.convert(parsed);
        debug!(path = %path.display(), faces = faces.len(), "Face extraction complete");
        Ok(faces)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Used when no embedding service is configured: every photo has no faces.
pub struct DisabledFaceExtractor;

impl FaceExtractor for DisabledFaceExtractor {
    fn extract_faces(&self, _path: &Path) -> Result<Vec<DetectedFace>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
