use std::collections::HashMap;

use storage::ScoredPoint;
use uuid::Uuid;

/// Standard reciprocal-rank constant; keeps low ranks from dominating.
const RRF_K: f32 = 60.0;

/// A candidate after per-collection retrieval, before the global merge.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub point: ScoredPoint,
    pub vector_score: f32,
    pub sparse_score: Option<f32>,
    pub rerank_score: Option<f32>,
    pub final_score: f32,
}

impl Candidate {
    pub fn dense(point: ScoredPoint) -> Self {
        let score = point.score;
        Self {
            point,
            vector_score: score,
            sparse_score: None,
            rerank_score: None,
            final_score: score,
        }
    }
}

/// Fuse a dense and a sparse ranking for one collection by reciprocal
/// rank. Raw scores are kept for reporting; the fused score orders the
/// result.
pub fn fuse_reciprocal_rank(dense: Vec<ScoredPoint>, sparse: Vec<ScoredPoint>) -> Vec<Candidate> {
    let mut fused: HashMap<Uuid, Candidate> = HashMap::new();

    for (rank, point) in dense.into_iter().enumerate() {
        let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
        let entry = fused.entry(point.id).or_insert_with(|| {
            let mut c = Candidate::dense(point);
            c.final_score = 0.0;
            c
        });
        entry.final_score += contribution;
    }

    for (rank, point) in sparse.into_iter().enumerate() {
        let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
        match fused.get_mut(&point.id) {
            Some(entry) => {
                entry.sparse_score = Some(point.score);
                entry.final_score += contribution;
            }
            None => {
                let sparse_score = point.score;
                let mut candidate = Candidate::dense(point);
                candidate.vector_score = 0.0;
                candidate.sparse_score = Some(sparse_score);
                candidate.final_score = contribution;
                fused.insert(candidate.point.id, candidate);
            }
        }
    }

    let mut candidates: Vec<Candidate> = fused.into_values().collect();
    candidates.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    candidates
}

/// Global top-K merge across collections: dedupe by chunk id keeping
/// the highest final score, then order descending.
pub fn merge_top_k(per_collection: Vec<Vec<Candidate>>, top_k: usize) -> Vec<Candidate> {
    let mut best: HashMap<Uuid, Candidate> = HashMap::new();
    for candidates in per_collection {
        for candidate in candidates {
            match best.get(&candidate.point.id) {
                Some(existing) if existing.final_score >= candidate.final_score => {}
                _ => {
                    best.insert(candidate.point.id, candidate);
                }
            }
        }
    }
    let mut merged: Vec<Candidate> = best.into_values().collect();
    merged.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_core::{ChunkPayload, SourceType};

    fn point(id: Uuid, score: f32) -> ScoredPoint {
        ScoredPoint {
            id,
            score,
            payload: ChunkPayload {
                content: "x".to_string(),
                relative_path: "a.rs".to_string(),
                start_line: 1,
                end_line: 1,
                file_extension: None,
                project_id: Uuid::nil(),
                dataset_id: Uuid::nil(),
                source_type: SourceType::Local,
                repo: None,
                branch: None,
                sha: None,
                lang: None,
                symbol: None,
                metadata: serde_json::Value::Null,
            },
        }
    }

    #[test]
    fn agreement_outranks_single_list_wins() {
        let shared = Uuid::new_v4();
        let dense_only = Uuid::new_v4();
        let sparse_only = Uuid::new_v4();

        let fused = fuse_reciprocal_rank(
            vec![point(dense_only, 0.99), point(shared, 0.80)],
            vec![point(shared, 12.0), point(sparse_only, 11.0)],
        );

        assert_eq!(fused[0].point.id, shared);
        assert_eq!(fused.len(), 3);
        let shared_candidate = &fused[0];
        assert!(shared_candidate.sparse_score.is_some());
        assert!(shared_candidate.vector_score > 0.0);
    }

    #[test]
    fn merge_dedupes_keeping_best() {
        let id = Uuid::new_v4();
        let mut a = Candidate::dense(point(id, 0.5));
        a.final_score = 0.5;
        let mut b = Candidate::dense(point(id, 0.9));
        b.final_score = 0.9;
        let other = Candidate::dense(point(Uuid::new_v4(), 0.7));

        let merged = merge_top_k(vec![vec![a], vec![b, other]], 10);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].point.id, id);
        assert!((merged[0].final_score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn merge_truncates_to_top_k() {
        let candidates: Vec<Candidate> = (0..10)
            .map(|i| {
                let mut c = Candidate::dense(point(Uuid::new_v4(), i as f32 / 10.0));
                c.final_score = i as f32 / 10.0;
                c
            })
            .collect();
        let merged = merge_top_k(vec![candidates], 3);
        assert_eq!(merged.len(), 3);
        assert!(merged[0].final_score >= merged[1].final_score);
        assert!(merged[1].final_score >= merged[2].final_score);
    }
}
