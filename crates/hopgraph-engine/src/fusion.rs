//! Weighted score fusion: `score = w * vector + (1 - w) * text`.
//!
//! Both inputs must already be scaled to [0, 1]. A document missing from one
//! side contributes 0 for that side. Ordering is fully deterministic: ties on
//! the fused score are broken by document key.

use hopgraph_core::{Document, ScoredDocument};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FusedDocument {
    pub document: Document,
    pub score: f32,
    pub vector_score: f32,
    pub text_score: f32,
}

pub fn fuse(
    vector: &[ScoredDocument],
    text: &[ScoredDocument],
    vector_weight: f32,
    id_field: &str,
    limit: usize,
) -> Vec<FusedDocument> {
    let w = vector_weight.clamp(0.0, 1.0);
    let mut by_key: HashMap<String, FusedDocument> = HashMap::new();

    for hit in vector {
        let entry = by_key
            .entry(doc_key(&hit.document, id_field))
            .or_insert_with(|| FusedDocument {
                document: hit.document.clone(),
                score: 0.0,
                vector_score: 0.0,
                text_score: 0.0,
            });
        entry.vector_score = entry.vector_score.max(hit.score);
    }
    for hit in text {
        let entry = by_key
            .entry(doc_key(&hit.document, id_field))
            .or_insert_with(|| FusedDocument {
                document: hit.document.clone(),
                score: 0.0,
                vector_score: 0.0,
                text_score: 0.0,
            });
        entry.text_score = entry.text_score.max(hit.score);
    }

    let mut fused: Vec<(String, FusedDocument)> = by_key
        .into_iter()
        .map(|(k, mut f)| {
            f.score = w * f.vector_score + (1.0 - w) * f.text_score;
            (k, f)
        })
        .collect();
    fused.sort_by(|(ka, a), (kb, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| ka.cmp(kb))
    });
    fused.truncate(limit);
    fused.into_iter().map(|(_, f)| f).collect()
}

/// Scale raw relevance scores into [0, 1] by the list maximum.
pub fn normalize_by_max(hits: &mut [ScoredDocument]) {
    let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
    if max <= f32::EPSILON {
        return;
    }
    for h in hits.iter_mut() {
        h.score = (h.score / max).clamp(0.0, 1.0);
    }
}

// Documents without an id are keyed by their serialized form.
fn doc_key(doc: &Document, id_field: &str) -> String {
    doc.id(id_field)
        .unwrap_or_else(|| serde_json::to_string(&doc.0).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(id: i64, score: f32) -> ScoredDocument {
        ScoredDocument {
            document: Document::from(json!({"_id": id})),
            score,
        }
    }

    #[test]
    fn weighted_fusion_scenario() {
        let vector = vec![hit(1, 0.9)];
        let text = vec![hit(1, 0.4), hit(2, 0.8)];
        let fused = fuse(&vector, &text, 0.5, "_id", 10);
        let ids: Vec<_> = fused.iter().map(|f| f.document.id("_id").unwrap()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!((fused[0].score - 0.65).abs() < 1e-6);
        assert!((fused[1].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn ordering_is_stable_across_runs() {
        let vector: Vec<_> = (0..20).map(|i| hit(i, 0.5)).collect();
        let text: Vec<_> = (10..30).map(|i| hit(i, 0.5)).collect();
        let first: Vec<_> = fuse(&vector, &text, 0.3, "_id", 15)
            .into_iter()
            .map(|f| f.document.id("_id"))
            .collect();
        for _ in 0..5 {
            let again: Vec<_> = fuse(&vector, &text, 0.3, "_id", 15)
                .into_iter()
                .map(|f| f.document.id("_id"))
                .collect();
            assert_eq!(first, again);
        }
        assert_eq!(first.len(), 15);
    }

    #[test]
    fn weight_extremes_ignore_one_side() {
        let fused = fuse(&[hit(1, 0.2)], &[hit(2, 0.9)], 1.0, "_id", 10);
        assert_eq!(fused[0].document.id("_id").as_deref(), Some("1"));
        assert_eq!(fused[1].score, 0.0);
    }

    #[test]
    fn normalize() {
        let mut hits = vec![hit(1, 4.0), hit(2, 2.0)];
        normalize_by_max(&mut hits);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);
    }
}
