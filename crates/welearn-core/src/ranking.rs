//! Post-retrieval re-ranking of search hits.
//!
//! # Maximal Marginal Relevance
//!
//! Hits come back from the vector store sorted by score. [`sort_slices_using_mmr`]
//! re-orders them so that near-duplicate slices do not crowd the top:
//!
//! ```text
//! selected  = [0]
//! remaining = [1, 2, ..., n-1]
//! while remaining:
//!     j = argmax_{i ∈ remaining}  θ·score[i] − (1−θ)·max_{s ∈ selected} cos(v[i], v[s])
//!     move j from remaining to selected
//! ```
//!
//! With `θ = 1` the order is unchanged; lower values trade relevance
//! for diversity. Ties resolve to the earliest candidate.
//!
//! # Slice concatenation
//!
//! [`concatenate_same_doc_id_slices`] collapses slices of the same document
//! into the first one seen, appending the later slice texts.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::models::ScoredPoint;
use crate::vector::pairwise_cosine;

/// Re-order `points` with maximal marginal relevance.
///
/// Points without a vector are treated as dissimilar to everything.
pub fn sort_slices_using_mmr(points: Vec<ScoredPoint>, theta: f32) -> Vec<ScoredPoint> {
    if points.is_empty() {
        return points;
    }

    let reward: Vec<f32> = points.iter().map(|p| p.score).collect();
    let vectors: Vec<&[f32]> = points
        .iter()
        .map(|p| p.vector.as_deref().unwrap_or(&[]))
        .collect();
    let sim = pairwise_cosine(&vectors);

    let mut selected = vec![0usize];
    let mut remaining: Vec<usize> = (1..points.len()).collect();

    while !remaining.is_empty() {
        let mut best_pos = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &i) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&s| sim[i][s])
                .fold(f32::NEG_INFINITY, f32::max);
            let mmr = theta * reward[i] - (1.0 - theta) * redundancy;
            if mmr > best_score {
                best_score = mmr;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }

    debug!(nb_results = points.len(), "sort_slices_using_mmr done");

    let mut slots: Vec<Option<ScoredPoint>> = points.into_iter().map(Some).collect();
    selected
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

/// Merge slices sharing a `document_id`.
///
/// The first slice of each document keeps its position and score; the
/// `slice_content` of later slices is appended to it, separated by a blank
/// line. Points with no payload or no `document_id` are dropped.
pub fn concatenate_same_doc_id_slices(points: Vec<ScoredPoint>) -> Vec<ScoredPoint> {
    let initial = points.len();
    let mut order: Vec<ScoredPoint> = Vec::new();
    let mut index_by_doc: HashMap<String, usize> = HashMap::new();

    for point in points {
        let doc_id = match point.document_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => continue,
        };

        match index_by_doc.get(&doc_id) {
            None => {
                index_by_doc.insert(doc_id, order.len());
                order.push(point);
            }
            Some(&idx) => {
                let extra = point.payload_str("slice_content").unwrap_or("").to_string();
                if let Some(payload) = order[idx].payload.as_mut() {
                    let current = payload
                        .get("slice_content")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    payload.insert(
                        "slice_content".to_string(),
                        Value::String(format!("{}\n\n{}", current, extra)),
                    );
                }
            }
        }
    }

    debug!(
        nb_results_initial = initial,
        nb_docs_final = order.len(),
        "concatenate_same_doc_id_slices done"
    );
    order
}
