//! Embedding matching against a candidate gallery.
//!
//! The default strategy picks, independently for every face, the candidate at
//! the smallest Euclidean distance. Two faces in the same image may therefore
//! resolve to the same student. [`AssignmentStrategy::Global`] instead solves
//! the face-to-candidate assignment jointly so each candidate is used at most
//! once per image.

use crate::types::{Candidate, Embedding, FaceRegion, RecognitionResult};
use serde::{Deserialize, Serialize};

/// Cost given to pairs that are over tolerance or incomparable in the global
/// assignment. Any such pair is reported as unknown afterwards.
const REJECT_COST: f64 = 1.0e6;

/// Result of comparing one query embedding against the candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    Matched {
        index: usize,
        distance: f32,
        confidence: f32,
    },
    Unknown {
        /// Distance to the nearest comparable candidate, if there was one.
        nearest: Option<f32>,
    },
}

impl MatchOutcome {
    /// Convert into a [`RecognitionResult`] for `region`.
    pub fn into_result(self, region: FaceRegion, candidates: &[Candidate]) -> RecognitionResult {
        match self {
            MatchOutcome::Matched { index, distance, confidence } => {
                let candidate = &candidates[index];
                RecognitionResult {
                    student_id: Some(candidate.student_id),
                    name: candidate.name.clone(),
                    matched: true,
                    confidence: Some(confidence),
                    distance: Some(distance),
                    region,
                }
            }
            MatchOutcome::Unknown { nearest } => RecognitionResult::unknown(region, nearest),
        }
    }
}

/// Map a distance to a confidence score in [0, 1].
pub fn confidence_for(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Strategy for comparing a query embedding against the enrolled candidates.
pub trait Matcher {
    fn compare(&self, query: &Embedding, candidates: &[Candidate], tolerance: f32) -> MatchOutcome;
}

/// Nearest-candidate matcher under Euclidean distance.
///
/// Ties on the minimum distance resolve to the earliest candidate: the scan
/// only replaces the best index on a strictly smaller distance.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, candidates: &[Candidate], tolerance: f32) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            let distance = query.euclidean_distance(&candidate.embedding);
            if !distance.is_finite() {
                continue;
            }
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((i, distance)),
            }
        }

        match best {
            Some((index, distance)) if distance <= tolerance => MatchOutcome::Matched {
                index,
                distance,
                confidence: confidence_for(distance),
            },
            Some((_, distance)) => MatchOutcome::Unknown { nearest: Some(distance) },
            None => MatchOutcome::Unknown { nearest: None },
        }
    }
}

/// How the faces of one image are assigned to candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategy {
    /// Independent nearest-candidate per face.
    #[default]
    Greedy,
    /// Minimum-total-distance one-to-one assignment across all faces.
    Global,
}

/// Match every query in `queries` against `candidates` using `strategy`.
///
/// The returned outcomes are in the same order as `queries`.
pub fn assign(
    queries: &[&Embedding],
    candidates: &[Candidate],
    tolerance: f32,
    strategy: AssignmentStrategy,
) -> Vec<MatchOutcome> {
    match strategy {
        AssignmentStrategy::Greedy => queries
            .iter()
            .map(|query| EuclideanMatcher.compare(query, candidates, tolerance))
            .collect(),
        AssignmentStrategy::Global => assign_global(queries, candidates, tolerance),
    }
}

fn assign_global(queries: &[&Embedding], candidates: &[Candidate], tolerance: f32) -> Vec<MatchOutcome> {
    if queries.is_empty() {
        return Vec::new();
    }

    let distances: Vec<Vec<f32>> = queries
        .iter()
        .map(|query| {
            candidates
                .iter()
                .map(|c| query.euclidean_distance(&c.embedding))
                .collect()
        })
        .collect();

    let nearest = |row: &[f32]| -> Option<f32> {
        row.iter().copied().filter(|d| d.is_finite()).fold(None, |acc, d| match acc {
            Some(best) if best <= d => Some(best),
            _ => Some(d),
        })
    };

    if candidates.is_empty() {
        return queries.iter().map(|_| MatchOutcome::Unknown { nearest: None }).collect();
    }

    let cost = |d: f32| -> f64 {
        if d.is_finite() && d <= tolerance {
            d as f64
        } else {
            REJECT_COST
        }
    };

    // The solver needs rows <= columns; transpose when there are more faces
    // than candidates.
    let transposed = queries.len() > candidates.len();
    let matrix: Vec<Vec<f64>> = if transposed {
        (0..candidates.len())
            .map(|j| distances.iter().map(|row| cost(row[j])).collect())
            .collect()
    } else {
        distances.iter().map(|row| row.iter().map(|&d| cost(d)).collect()).collect()
    };

    let solved = hungarian(&matrix);
    let mut face_to_candidate: Vec<Option<usize>> = vec![None; queries.len()];
    for (row, col) in solved.into_iter().enumerate() {
        if let Some(col) = col {
            if transposed {
                face_to_candidate[col] = Some(row);
            } else {
                face_to_candidate[row] = Some(col);
            }
        }
    }

    face_to_candidate
        .into_iter()
        .enumerate()
        .map(|(face, assigned)| {
            let row = &distances[face];
            match assigned {
                Some(index) if row[index].is_finite() && row[index] <= tolerance => {
                    MatchOutcome::Matched {
                        index,
                        distance: row[index],
                        confidence: confidence_for(row[index]),
                    }
                }
                _ => MatchOutcome::Unknown { nearest: nearest(row) },
            }
        })
        .collect()
}

/// Minimum-cost assignment for an `n x m` cost matrix with `n <= m`
/// (Hungarian algorithm with potentials, O(n^2 m)).
///
/// Returns, for each row, the column it was assigned to.
fn hungarian(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let n = cost.len();
    let m = cost.first().map_or(0, |r| r.len());
    if n == 0 || m == 0 {
        return vec![None; n];
    }

    // 1-based indexing; column 0 is a virtual start column.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; n];
    for j in 1..=m {
        if p[j] != 0 {
            assignment[p[j] - 1] = Some(j - 1);
        }
    }
    assignment
}
