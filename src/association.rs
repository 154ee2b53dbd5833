// src/association.rs
//
// Frame-to-frame identity association by nearest centroid under a
// fixed pixel gate. Two matching modes: `legacy` preserves the
// original processing-order semantics (first detection to reach a
// track claims it, later detections mint fresh ids), `greedy_distance`
// resolves conflicts globally by ascending distance.

use crate::types::{MatchingMode, RiskAssessment, TrackingConfig};
use std::collections::HashMap;
use tracing::debug;

/// Per-identity record. All cross-frame state for one object lives
/// here rather than in ambient per-component maps, so the tracker can
/// be instantiated per pipeline and tested deterministically.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub id: u32,
    pub centroid: (f32, f32),
    /// Exponentially smoothed motion in km/h; None until the first
    /// flow sample for this identity.
    pub smoothed_motion: Option<f32>,
    pub last_risk: Option<RiskAssessment>,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
}

impl TrackedObject {
    fn new(id: u32, centroid: (f32, f32), frame_id: u64) -> Self {
        Self {
            id,
            centroid,
            smoothed_motion: None,
            last_risk: None,
            first_seen_frame: frame_id,
            last_seen_frame: frame_id,
        }
    }
}

pub struct ObjectTracker {
    cfg: TrackingConfig,
    next_id: u32,
    tracks: HashMap<u32, TrackedObject>,
}

impl ObjectTracker {
    pub fn new(cfg: TrackingConfig) -> Self {
        Self {
            cfg,
            next_id: 0,
            tracks: HashMap::new(),
        }
    }

    /// Associate one frame's detection centroids with the previous
    /// frame's identities. Returns one id per centroid, in input
    /// order. Previous identities with no match inside the gate are
    /// dropped; there is no re-identification after occlusion.
    pub fn associate(&mut self, centroids: &[(f32, f32)], frame_id: u64) -> Vec<u32> {
        let assigned = match self.cfg.matching {
            MatchingMode::Legacy => self.match_in_order(centroids),
            MatchingMode::GreedyDistance => self.match_by_distance(centroids),
        };

        let mut next_tracks: HashMap<u32, TrackedObject> = HashMap::new();
        let mut ids = Vec::with_capacity(centroids.len());

        for (i, matched) in assigned.iter().enumerate() {
            let centroid = centroids[i];
            let track = match matched {
                Some(id) => match self.tracks.remove(id) {
                    Some(mut track) => {
                        track.centroid = centroid;
                        track.last_seen_frame = frame_id;
                        track
                    }
                    None => TrackedObject::new(*id, centroid, frame_id),
                },
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!("new identity #{} at ({:.0}, {:.0})", id, centroid.0, centroid.1);
                    TrackedObject::new(id, centroid, frame_id)
                }
            };
            ids.push(track.id);
            next_tracks.insert(track.id, track);
        }

        let dropped = self.tracks.len();
        if dropped > 0 {
            debug!("dropped {} unmatched identit(ies)", dropped);
        }
        self.tracks = next_tracks;
        ids
    }

    fn match_in_order(&self, centroids: &[(f32, f32)]) -> Vec<Option<u32>> {
        let mut claimed: Vec<u32> = Vec::new();
        centroids
            .iter()
            .map(|c| {
                let mut best: Option<(u32, f32)> = None;
                for (id, track) in &self.tracks {
                    if claimed.contains(id) {
                        continue;
                    }
                    let d = euclidean(*c, track.centroid);
                    if d < self.cfg.gate_px && best.map_or(true, |(_, bd)| d < bd) {
                        best = Some((*id, d));
                    }
                }
                match best {
                    Some((id, _)) => {
                        claimed.push(id);
                        Some(id)
                    }
                    None => None,
                }
            })
            .collect()
    }

    fn match_by_distance(&self, centroids: &[(f32, f32)]) -> Vec<Option<u32>> {
        let mut pairs: Vec<(usize, u32, f32)> = Vec::new();
        for (i, c) in centroids.iter().enumerate() {
            for (id, track) in &self.tracks {
                let d = euclidean(*c, track.centroid);
                if d < self.cfg.gate_px {
                    pairs.push((i, *id, d));
                }
            }
        }
        pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut assigned: Vec<Option<u32>> = vec![None; centroids.len()];
        let mut used_ids: Vec<u32> = Vec::new();
        for (i, id, _) in pairs {
            if assigned[i].is_some() || used_ids.contains(&id) {
                continue;
            }
            assigned[i] = Some(id);
            used_ids.push(id);
        }
        assigned
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut TrackedObject> {
        self.tracks.get_mut(&id)
    }

    pub fn get(&self, id: u32) -> Option<&TrackedObject> {
        self.tracks.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    /// Total identities minted over the run.
    pub fn unique_count(&self) -> u32 {
        self.next_id
    }
}

fn euclidean(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(matching: MatchingMode) -> ObjectTracker {
        ObjectTracker::new(TrackingConfig {
            gate_px: 50.0,
            matching,
        })
    }

    #[test]
    fn test_first_detection_mints_identity() {
        let mut t = tracker(MatchingMode::Legacy);
        let ids = t.associate(&[(100.0, 100.0)], 1);
        assert_eq!(ids, vec![0]);
        assert_eq!(t.active_count(), 1);
        assert_eq!(t.unique_count(), 1);
    }

    #[test]
    fn test_match_within_gate_keeps_identity() {
        let mut t = tracker(MatchingMode::Legacy);
        let ids = t.associate(&[(100.0, 100.0)], 1);
        let ids2 = t.associate(&[(120.0, 110.0)], 2);
        assert_eq!(ids, ids2);
        assert_eq!(t.unique_count(), 1);
        assert_eq!(t.get(ids2[0]).unwrap().first_seen_frame, 1);
    }

    #[test]
    fn test_beyond_gate_mints_and_drops() {
        let mut t = tracker(MatchingMode::Legacy);
        t.associate(&[(100.0, 100.0)], 1);
        let ids = t.associate(&[(300.0, 300.0)], 2);
        assert_eq!(ids, vec![1]);
        // unmatched previous identity is gone
        assert_eq!(t.active_count(), 1);
        assert!(t.get(0).is_none());
    }

    #[test]
    fn test_processing_order_claims_one_mints_other() {
        // Previous identity at (100,100); two current centroids both
        // inside the gate. The first (in processing order) claims the
        // identity, the second mints a new one.
        let mut t = tracker(MatchingMode::Legacy);
        let first = t.associate(&[(100.0, 100.0)], 1);
        let ids = t.associate(&[(101.0, 101.0), (102.0, 102.0)], 2);
        assert_eq!(ids[0], first[0]);
        assert_ne!(ids[1], first[0]);
        assert_eq!(t.active_count(), 2);
    }

    #[test]
    fn test_legacy_vs_greedy_conflict_winner() {
        // One previous identity at (100,100). Detections arrive as
        // [(110,100), (101,100)]: legacy gives the identity to the
        // first by order, greedy gives it to the closer second.
        let mut legacy = tracker(MatchingMode::Legacy);
        let prev = legacy.associate(&[(100.0, 100.0)], 1);
        let ids = legacy.associate(&[(110.0, 100.0), (101.0, 100.0)], 2);
        assert_eq!(ids[0], prev[0]);
        assert_ne!(ids[1], prev[0]);

        let mut greedy = tracker(MatchingMode::GreedyDistance);
        let prev = greedy.associate(&[(100.0, 100.0)], 1);
        let ids = greedy.associate(&[(110.0, 100.0), (101.0, 100.0)], 2);
        assert_ne!(ids[0], prev[0]);
        assert_eq!(ids[1], prev[0]);
    }

    #[test]
    fn test_matched_track_carries_state() {
        let mut t = tracker(MatchingMode::Legacy);
        let ids = t.associate(&[(100.0, 100.0)], 1);
        t.get_mut(ids[0]).unwrap().smoothed_motion = Some(42.0);

        let ids2 = t.associate(&[(105.0, 100.0)], 2);
        assert_eq!(t.get(ids2[0]).unwrap().smoothed_motion, Some(42.0));
        assert_eq!(t.get(ids2[0]).unwrap().centroid, (105.0, 100.0));
    }
}
