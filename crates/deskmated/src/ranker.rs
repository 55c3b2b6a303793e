//! Passage ranker: threshold, dedupe by source id, cap, similarity order.

use deskmate_shared::Passage;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassageRanker {
    threshold: f32,
    cap: usize,
}

impl PassageRanker {
    pub fn new(threshold: f32, cap: usize) -> Self {
        Self { threshold, cap }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Rank raw nearest-neighbour results given as `(passage, distance)`,
    /// distance being `1 - cosine`. The returned passages carry their
    /// similarity. An empty result means no relevant knowledge.
    pub fn rank(&self, results: Vec<(Passage, f32)>) -> Vec<Passage> {
        let retrieved = results.len();
        let mut kept: Vec<Passage> = results
            .into_iter()
            .filter_map(|(mut passage, distance)| {
                let similarity = 1.0 - distance;
                if similarity.is_nan() || similarity < self.threshold {
                    return None;
                }
                passage.similarity = similarity;
                Some(passage)
            })
            .collect();

        // sort_by is stable: equal similarities keep retrieval order
        kept.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut seen = HashSet::new();
        kept.retain(|p| seen.insert(p.source_id().to_string()));
        kept.truncate(self.cap);

        debug!(
            "ranker: {} retrieved, {} kept (threshold {:.2}, cap {})",
            retrieved,
            kept.len(),
            self.threshold,
            self.cap
        );
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskmate_shared::Category;

    fn hit(id: &str, similarity: f32) -> (Passage, f32) {
        (Passage::new(id, Category::Networking, format!("text {}", id)), 1.0 - similarity)
    }

    fn ids(passages: &[Passage]) -> Vec<&str> {
        passages.iter().map(|p| p.source_id()).collect()
    }

    #[test]
    fn test_threshold_drops_weak_hits() {
        let ranked = PassageRanker::new(0.5, 5).rank(vec![hit("a", 0.9), hit("b", 0.4)]);
        assert_eq!(ids(&ranked), vec!["a"]);
        assert!((ranked[0].similarity - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_dedupe_keeps_best_occurrence() {
        let ranked =
            PassageRanker::new(0.1, 5).rank(vec![hit("a", 0.5), hit("b", 0.6), hit("a", 0.8)]);
        assert_eq!(ids(&ranked), vec!["a", "b"]);
        assert!((ranked[0].similarity - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_ties_keep_retrieval_order() {
        let ranked =
            PassageRanker::new(0.1, 5).rank(vec![hit("x", 0.5), hit("y", 0.7), hit("z", 0.5)]);
        assert_eq!(ids(&ranked), vec!["y", "x", "z"]);
    }

    #[test]
    fn test_cap_applies_after_ordering() {
        let ranked = PassageRanker::new(0.0, 2).rank(vec![
            hit("a", 0.2),
            hit("b", 0.9),
            hit("c", 0.5),
        ]);
        assert_eq!(ids(&ranked), vec!["b", "c"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(PassageRanker::new(0.35, 5).rank(Vec::new()).is_empty());
    }

    #[test]
    fn test_output_contract_over_generated_inputs() {
        // small linear congruential generator, fixed seed
        let mut state: u32 = 7;
        let mut next = move || {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 8) as f32 / (1u32 << 24) as f32
        };
        let ranker = PassageRanker::new(0.35, 5);
        for _ in 0..200 {
            let n = (next() * 12.0) as usize;
            let results: Vec<(Passage, f32)> = (0..n)
                .map(|_| {
                    let id = format!("s{}", (next() * 6.0) as usize);
                    hit(&id, next())
                })
                .collect();
            let ranked = ranker.rank(results);
            assert!(ranked.len() <= 5);
            assert!(ranked.iter().all(|p| p.similarity >= 0.35));
            let unique: HashSet<&str> = ranked.iter().map(|p| p.source_id()).collect();
            assert_eq!(unique.len(), ranked.len());
            assert!(ranked.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        }
    }
}
