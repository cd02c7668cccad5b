//! Incremental linear face clustering.
//!
//! Faces are visited in input order. A face that already has a cluster keeps
//! it. Any other face joins the cluster of its most similar earlier face when
//! their cosine distance is under the threshold, and otherwise opens a new
//! cluster. Blurry faces must be closer to join.

use crate::blur::LAPLACIAN_HARD_THRESHOLD;
use crate::search::dot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.24;
pub const DEFAULT_CONSERVATIVE_DISTANCE_THRESHOLD: f32 = 0.06;

#[derive(Error, Debug, PartialEq)]
pub enum ClusteringError {
    #[error("face '{face_id}' has embedding dimension {got}, expected {expected}")]
    Dimension {
        face_id: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringFace {
    pub face_id: String,
    pub embedding: Vec<f32>,
    pub blur: f32,
    #[serde(default)]
    pub cluster_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusteringThresholds {
    pub distance: f32,
    /// Used for faces whose blur is under [`LAPLACIAN_HARD_THRESHOLD`].
    pub conservative_distance: f32,
}

impl Default for ClusteringThresholds {
    fn default() -> Self {
        Self {
            distance: DEFAULT_DISTANCE_THRESHOLD,
            conservative_distance: DEFAULT_CONSERVATIVE_DISTANCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringResult {
    pub assignments: BTreeMap<String, String>,
    pub new_clusters: usize,
}

pub fn cluster_faces(
    faces: &[ClusteringFace],
    thresholds: ClusteringThresholds,
) -> Result<ClusteringResult, ClusteringError> {
    if let Some(first) = faces.first() {
        let expected = first.embedding.len();
        if let Some(bad) = faces.iter().find(|f| f.embedding.len() != expected) {
            return Err(ClusteringError::Dimension {
                face_id: bad.face_id.clone(),
                expected,
                got: bad.embedding.len(),
            });
        }
    }

    let mut result = ClusteringResult::default();
    let mut clusters: Vec<String> = Vec::with_capacity(faces.len());

    for (i, face) in faces.iter().enumerate() {
        let cluster = match &face.cluster_id {
            Some(existing) => existing.clone(),
            None => {
                let threshold = if face.blur < LAPLACIAN_HARD_THRESHOLD {
                    thresholds.conservative_distance
                } else {
                    thresholds.distance
                };
                let nearest = faces[..i]
                    .iter()
                    .enumerate()
                    .map(|(j, other)| (j, 1.0 - dot(&face.embedding, &other.embedding)))
                    .min_by(|a, b| a.1.total_cmp(&b.1));

                match nearest {
                    Some((j, distance)) if distance < threshold => clusters[j].clone(),
                    _ => {
                        result.new_clusters += 1;
                        Uuid::new_v4().to_string()
                    }
                }
            }
        };
        result.assignments.insert(face.face_id.clone(), cluster.clone());
        clusters.push(cluster);
    }

    tracing::debug!(
        faces = faces.len(),
        new_clusters = result.new_clusters,
        "incremental clustering done"
    );
    Ok(result)
}
