//! Data-quality checks on search hits.
//!
//! [`remove_duplicates`] fingerprints each point from a set of string
//! payload keys and keeps only the first point per fingerprint. The
//! fingerprint is a SHA-256 over the sorted `key ‖ value` byte strings, so
//! the order of `keys` does not matter.

use sha2::{Digest, Sha256};
use std::collections::{HashSet, BTreeSet};
use thiserror::Error;
use tracing::{error, info};

use crate::models::ScoredPoint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QualityError {
    #[error("the method needs a key to check duplicates and 'keys' is empty")]
    NoKeys,
    #[error("point {point} doesn't have key {key}")]
    MissingKey { point: String, key: String },
    #[error("data quality deduplication can only be applied on strings, {key} is not a string")]
    NotAString { key: String },
}

/// Result of a deduplication pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduplicated {
    /// Points kept, in input order.
    pub kept: Vec<ScoredPoint>,
    /// Points that were dropped as duplicates, in input order.
    pub duplicates: Vec<ScoredPoint>,
}

impl Deduplicated {
    /// Distinct `document_id`s among the dropped points.
    pub fn duplicated_document_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for p in &self.duplicates {
            match p.document_id() {
                Some(id) => {
                    ids.insert(id.to_string());
                }
                None => error!(point = %p.id, "duplicated point has no document id in payload"),
            }
        }
        ids
    }
}

/// Remove duplicated points according to `keys` in their payloads.
///
/// Keys must be first-level payload keys. With `strict`, a missing key or a
/// non-string value is an error; otherwise it is logged and ignored. An empty
/// key list returns the input unchanged unless `strict`.
/// Points without a payload are always kept.
pub fn remove_duplicates(
    keys: &[&str],
    points: Vec<ScoredPoint>,
    strict: bool,
) -> Result<Deduplicated, QualityError> {
    if keys.is_empty() {
        error!("{}", QualityError::NoKeys);
        if strict {
            return Err(QualityError::NoKeys);
        }
        return Ok(Deduplicated {
            kept: points,
            duplicates: Vec::new(),
        });
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Deduplicated::default();

    for point in points {
        if point.payload.is_none() {
            error!(point = %point.id, "point has no payload, deduplication ignored");
            out.kept.push(point);
            continue;
        }

        let digest = fingerprint(keys, &point, strict)?;
        if seen.insert(digest) {
            out.kept.push(point);
        } else {
            info!(point = %point.id, ?keys, "duplicated point");
            out.duplicates.push(point);
        }
    }

    Ok(out)
}

fn fingerprint(keys: &[&str], point: &ScoredPoint, strict: bool) -> Result<String, QualityError> {
    let mut values: Vec<Vec<u8>> = Vec::with_capacity(keys.len());
    let payload = match point.payload.as_ref() {
        Some(p) => p,
        None => return Ok(String::new()),
    };

    for key in keys {
        match payload.get(*key) {
            None => {
                error!(point = %point.id, key, "point is missing deduplication key");
                if strict {
                    return Err(QualityError::MissingKey {
                        point: point.id.to_string(),
                        key: key.to_string(),
                    });
                }
            }
            Some(serde_json::Value::String(s)) => {
                let mut bytes = key.as_bytes().to_vec();
                bytes.extend_from_slice(s.as_bytes());
                values.push(bytes);
            }
            Some(_) => {
                if strict {
                    return Err(QualityError::NotAString {
                        key: key.to_string(),
                    });
                }
                error!(key, "non-string value ignored for deduplication");
            }
        }
    }

    values.sort();
    let mut hasher = Sha256::new();
    for v in &values {
        hasher.update(v);
    }
    Ok(hex::encode(hasher.finalize()))
}
