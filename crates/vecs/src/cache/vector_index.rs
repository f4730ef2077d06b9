//! L2: IVFFlat approximate vector index with online centroid adaptation,
//! hybrid text-based penalty scoring, and lazy swap-remove eviction.
//!
//! Centroids are learned online, with no offline training phase or rebuild
//! step, since the workload is mixed read/write with no corpus up front to
//! train against.

use std::time::{Duration, SystemTime};

use crate::error::{Result, VecsError};

/// Design constants, not configuration. Changing their *semantics* (as
/// opposed to exposing them as constants) would change the index's recall
/// characteristics in ways the rest of the system assumes are fixed.
pub const NUM_CLUSTERS: usize = 64;
pub const N_PROBE: usize = 4;
const ADAPT_RATE: f32 = 0.1;

/// Raw cosine above which the hybrid penalties are worth computing at all.
const PENALTY_ELIGIBLE: f32 = 0.5;
const LENGTH_DISPARITY_RATIO: f32 = 0.5;
const LENGTH_DISPARITY_PENALTY: f32 = 0.8;
const NEGATION_MISMATCH_PENALTY: f32 = 0.75;
const SEMANTIC_DELETE_THRESHOLD: f32 = 0.99;

const NEGATION_TOKENS: [&str; 5] = [" non ", " no ", " not ", " never ", " mai "];

struct VectorEntry {
    vector: Vec<f32>,
    prompt: String,
    response: String,
    expires_at: SystemTime,
}

struct Cluster {
    centroid: Vec<f32>,
    entries: Vec<VectorEntry>,
    initialized: bool,
}

impl Cluster {
    fn new(dim: usize) -> Self {
        Self { centroid: vec![0.0; dim], entries: Vec::new(), initialized: false }
    }
}

/// Fixed array of `NUM_CLUSTERS` clusters over vectors of dimension `dim`,
/// capped at `capacity` live entries globally.
pub struct VectorIndex {
    clusters: Vec<Cluster>,
    dim: usize,
    total_count: usize,
    capacity: usize,
}

impl VectorIndex {
    pub fn new(dim: usize, capacity: usize) -> Self {
        Self {
            clusters: (0..NUM_CLUSTERS).map(|_| Cluster::new(dim)).collect(),
            dim,
            total_count: 0,
            capacity,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.total_count
    }

    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    /// Bootstraps uninitialized clusters one real data point at a time,
    /// then assigns by nearest centroid (ties go to the lowest index) and
    /// folds the new point into that cluster's centroid via EMA.
    pub fn insert(&mut self, vector: &[f32], prompt: &str, response: &str, ttl: Duration) -> Result<()> {
        if self.total_count >= self.capacity {
            return Err(VecsError::L2Full);
        }
        debug_assert_eq!(vector.len(), self.dim);

        let target = self
            .clusters
            .iter()
            .position(|c| !c.initialized)
            .unwrap_or_else(|| self.nearest_centroid(vector));

        let cluster = &mut self.clusters[target];
        cluster.entries.push(VectorEntry {
            vector: vector.to_vec(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            expires_at: SystemTime::now() + ttl,
        });
        self.total_count += 1;

        if !cluster.initialized {
            cluster.centroid.copy_from_slice(vector);
            cluster.initialized = true;
        } else {
            update_centroid(&mut cluster.centroid, vector);
        }
        Ok(())
    }

    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        let mut best_idx = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (idx, cluster) in self.clusters.iter().enumerate() {
            let score = dot(&cluster.centroid, vector);
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        best_idx
    }

    /// Coarse-then-fine search: rank clusters by centroid similarity, then
    /// exact-scan the top `min(N_PROBE, active_clusters)` of them, applying
    /// hybrid penalties and evicting expired entries along the way.
    ///
    /// `query_text` is the *original* (un-normalized) prompt, matched
    /// against the same textual form stored at insert time.
    pub fn search(&mut self, query_vector: &[f32], query_text: &str, threshold: f32) -> Option<String> {
        if self.total_count == 0 {
            return None;
        }
        let candidates = self.coarse_rank(query_vector);
        if candidates.is_empty() {
            return None;
        }
        let probes = candidates.len().min(N_PROBE);

        let query_has_neg = has_negation(query_text);
        let query_len = query_text.len();
        let now = SystemTime::now();

        let mut best_score = f32::NEG_INFINITY;
        let mut best: Option<(usize, usize)> = None;

        for &cluster_idx in candidates.iter().take(probes) {
            let cluster = &mut self.clusters[cluster_idx];
            let mut i = 0;
            while i < cluster.entries.len() {
                if now > cluster.entries[i].expires_at {
                    cluster.entries.swap_remove(i);
                    self.total_count -= 1;
                    continue;
                }

                let mut score = dot(query_vector, &cluster.entries[i].vector);
                if score > PENALTY_ELIGIBLE {
                    let entry_len = cluster.entries[i].prompt.len();
                    let diff = query_len.abs_diff(entry_len);
                    let ratio = diff as f32 / query_len.max(entry_len) as f32;
                    if ratio > LENGTH_DISPARITY_RATIO {
                        score *= LENGTH_DISPARITY_PENALTY;
                    }
                    if query_has_neg != has_negation(&cluster.entries[i].prompt) {
                        score *= NEGATION_MISMATCH_PENALTY;
                    }
                }

                if score > best_score {
                    best_score = score;
                    best = Some((cluster_idx, i));
                }
                i += 1;
            }
        }

        match best {
            Some((c, e)) if best_score >= threshold => Some(self.clusters[c].entries[e].response.clone()),
            _ => None,
        }
    }

    /// Removes the first entry across the top-`N_PROBE` clusters whose raw
    /// cosine is at least `0.99`. Returns whether one was removed.
    pub fn delete_semantic(&mut self, query_vector: &[f32]) -> bool {
        let candidates = self.coarse_rank(query_vector);
        let probes = candidates.len().min(N_PROBE);

        for &cluster_idx in candidates.iter().take(probes) {
            let cluster = &mut self.clusters[cluster_idx];
            for i in 0..cluster.entries.len() {
                if dot(query_vector, &cluster.entries[i].vector) >= SEMANTIC_DELETE_THRESHOLD {
                    cluster.entries.swap_remove(i);
                    self.total_count -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn coarse_rank(&self, query_vector: &[f32]) -> Vec<usize> {
        let mut candidates: Vec<(usize, f32)> = self
            .clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.initialized && !c.entries.is_empty())
            .map(|(idx, c)| (idx, dot(&c.centroid, query_vector)))
            .collect();
        // Stable sort preserves index order among ties, matching "lowest
        // index wins" for equal centroid scores.
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.into_iter().map(|(idx, _)| idx).collect()
    }

    pub fn clear(&mut self) {
        for cluster in &mut self.clusters {
            cluster.entries.clear();
            cluster.initialized = false;
            cluster.centroid.iter_mut().for_each(|v| *v = 0.0);
        }
        self.total_count = 0;
    }

    /// Iterates live (non-expired) entries for snapshotting.
    pub fn iter_live(&self) -> impl Iterator<Item = (&[f32], &str, &str, SystemTime)> {
        let now = SystemTime::now();
        self.clusters.iter().flat_map(move |c| c.entries.iter()).filter(move |e| e.expires_at > now).map(|e| {
            (e.vector.as_slice(), e.prompt.as_str(), e.response.as_str(), e.expires_at)
        })
    }

    /// Reinserts an entry restored from a snapshot through the normal
    /// insert path, so centroids retrain during restore. Silently skips an
    /// already-expired entry, and silently drops the entry if the index is
    /// at capacity (mirrors the insert-time capacity policy).
    pub fn restore(&mut self, vector: &[f32], prompt: &str, response: &str, expires_at: SystemTime) {
        let now = SystemTime::now();
        if let Ok(ttl) = expires_at.duration_since(now) {
            let _ = self.insert(vector, prompt, response, ttl);
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn update_centroid(centroid: &mut [f32], new_vec: &[f32]) {
    for (c, v) in centroid.iter_mut().zip(new_vec) {
        *c = *c * (1.0 - ADAPT_RATE) + v * ADAPT_RATE;
    }
    let norm = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for c in centroid.iter_mut() {
            *c /= norm;
        }
    }
}

fn has_negation(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEGATION_TOKENS.iter().any(|tok| lower.contains(tok))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
        v
    }

    #[test]
    fn bootstrap_seeds_centroid_with_first_vector_verbatim() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "hello", "world", Duration::from_secs(60)).unwrap();
        assert_eq!(idx.len(), 1);
        let hit = idx.search(&v, "hello", 0.1);
        assert_eq!(hit.as_deref(), Some("world"));
    }

    #[test]
    fn insert_refuses_at_capacity() {
        let mut idx = VectorIndex::new(4, 1);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "a", "1", Duration::from_secs(60)).unwrap();
        let w = unit(vec![0.0, 1.0, 0.0, 0.0]);
        assert!(matches!(idx.insert(&w, "b", "2", Duration::from_secs(60)), Err(VecsError::L2Full)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn search_below_threshold_misses() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "hello world", "resp", Duration::from_secs(60)).unwrap();
        let orthogonal = unit(vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(idx.search(&orthogonal, "totally unrelated", 0.65), None);
    }

    #[test]
    fn negation_mismatch_drops_an_otherwise_matching_score_below_threshold() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.01, 0.0, 0.0]);
        idx.insert(&v, "dogs are mammals", "true", Duration::from_secs(60)).unwrap();
        // Same vector direction (near-identical cosine) but negated text.
        let hit = idx.search(&v, "dogs are not mammals", 0.99);
        assert_eq!(hit, None);
    }

    #[test]
    fn length_disparity_applies_penalty() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "hi", "resp", Duration::from_secs(60)).unwrap();
        let long_query = "h".repeat(40);
        // Cosine is 1.0 but the huge length disparity multiplies it by 0.8,
        // so a threshold just above 0.8 should miss.
        assert_eq!(idx.search(&v, &long_query, 0.81), None);
        assert_eq!(idx.search(&v, &long_query, 0.79).as_deref(), Some("resp"));
    }

    #[test]
    fn delete_semantic_removes_near_duplicate_only() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "a", "1", Duration::from_secs(60)).unwrap();
        let unrelated = unit(vec![0.0, 1.0, 0.0, 0.0]);
        assert!(!idx.delete_semantic(&unrelated));
        assert_eq!(idx.len(), 1);
        assert!(idx.delete_semantic(&v));
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn expired_entries_are_evicted_lazily_during_search() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "bye", "resp", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(idx.search(&v, "bye", 0.1), None);
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn n_probe_greater_than_active_clusters_visits_only_active_ones() {
        let mut idx = VectorIndex::new(4, 100);
        let v = unit(vec![1.0, 0.0, 0.0, 0.0]);
        idx.insert(&v, "only one", "resp", Duration::from_secs(60)).unwrap();
        assert_eq!(idx.search(&v, "only one", 0.9).as_deref(), Some("resp"));
    }
}
