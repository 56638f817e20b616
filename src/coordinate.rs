//! src/coordinate.rs
//!
//! Vivaldi network coordinates (§4.8): a lightweight embedding of observed
//! round-trip latencies into Euclidean space, so any two nodes can
//! estimate their distance without probing each other. Disabled entirely
//! when `disable_coordinates` is set, in which case `CoordinateClient` is
//! simply never constructed.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64;
use std::time::Duration;

const DIMENSIONALITY: usize = 8;
const HEIGHT_MIN: f64 = 1.0e-5;
const VIVALDI_CE: f64 = 0.25;
const VIVALDI_CC: f64 = 0.25;
const VIVALDI_ERROR_MAX: f64 = 1.5;
const ADJUSTMENT_WINDOW_SIZE: usize = 20;
const GRAVITY_RHO: f64 = 150.0;
const LATENCY_FILTER_SIZE: usize = 3;
const ZERO_THRESHOLD: f64 = 1.0e-6;

/// A point in the Vivaldi coordinate space: an 8-dimensional Euclidean
/// vector, a non-negative "height" accounting for the part of latency not
/// explained by Euclidean distance, and an error estimate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

impl Coordinate {
    pub fn origin() -> Self {
        Self {
            vec: vec![0.0; DIMENSIONALITY],
            error: VIVALDI_ERROR_MAX,
            adjustment: 0.0,
            height: HEIGHT_MIN,
        }
    }

    /// Estimated one-way distance to `other`, in seconds: Euclidean
    /// distance plus both nodes' heights, floored at zero and adjusted by
    /// the per-node latency-correction terms.
    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        let raw = euclidean_distance(&self.vec, &other.vec) + self.height + other.height;
        let adjusted = raw + self.adjustment + other.adjustment;
        Duration::from_secs_f64(adjusted.max(0.0))
    }

    fn is_valid(&self) -> bool {
        self.vec.iter().all(|v| v.is_finite())
            && self.error.is_finite()
            && self.adjustment.is_finite()
            && self.height.is_finite()
    }
}

fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn unit_vector_away_from(a: &[f64], b: &[f64]) -> Vec<f64> {
    let diff: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x - y).collect();
    let mag = diff.iter().map(|v| v * v).sum::<f64>().sqrt();
    if mag > ZERO_THRESHOLD {
        diff.into_iter().map(|v| v / mag).collect()
    } else {
        // Coincident points: nudge apart along a fixed, arbitrary axis
        // rather than dividing by zero.
        let mut unit = vec![0.0; a.len()];
        unit[0] = 1.0;
        unit
    }
}

/// Tracks one node's own coordinate and observed latency samples, applying
/// the Vivaldi update rule on every RTT observation. Not thread-safe by
/// itself; owned exclusively by the component (the probe loop) that feeds
/// it observations.
pub struct CoordinateClient {
    coord: Coordinate,
    origin: Coordinate,
    latency_filter: VecDeque<f64>,
    adjustment_window: VecDeque<f64>,
    resets: u64,
}

impl CoordinateClient {
    pub fn new() -> Self {
        Self {
            coord: Coordinate::origin(),
            origin: Coordinate::origin(),
            latency_filter: VecDeque::with_capacity(LATENCY_FILTER_SIZE),
            adjustment_window: VecDeque::with_capacity(ADJUSTMENT_WINDOW_SIZE),
            resets: 0,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        self.coord.clone()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Folds one observed round-trip time to `other` (whose coordinate is
    /// `other`) into the local estimate, per the Vivaldi update rule. `rtt`
    /// must be non-negative; callers measuring wall-clock time naturally
    /// satisfy this.
    pub fn update(&mut self, other: &Coordinate, rtt: Duration) {
        if !other.is_valid() {
            self.resets += 1;
            self.coord = Coordinate::origin();
            return;
        }

        let rtt_secs = self.filtered_rtt(rtt.as_secs_f64());
        let dist = self.coord.distance_to(other).as_secs_f64();

        let weight = self.coord.error / (self.coord.error + other.error).max(ZERO_THRESHOLD);
        let err_estimate = (dist - rtt_secs).abs() / rtt_secs.max(ZERO_THRESHOLD);
        let err_sample = (err_estimate * VIVALDI_CE * weight
            + self.coord.error * (1.0 - VIVALDI_CE * weight))
            .min(VIVALDI_ERROR_MAX);

        let delta = VIVALDI_CC * weight;
        let force = delta * (rtt_secs - dist);
        let direction = unit_vector_away_from(&self.coord.vec, &other.vec);

        let mut new_vec = self.coord.vec.clone();
        for (v, d) in new_vec.iter_mut().zip(direction.iter()) {
            *v += d * force;
        }

        let new_height = (self.coord.height + (rtt_secs - dist) * delta).max(HEIGHT_MIN);

        self.coord.vec = new_vec;
        self.coord.height = new_height;
        self.coord.error = err_estimate.min(VIVALDI_ERROR_MAX).min(err_sample.max(0.0));
        self.update_adjustment(rtt_secs, dist);

        if !self.coord.is_valid() {
            self.resets += 1;
            self.coord = self.origin.clone();
        }
    }

    fn filtered_rtt(&mut self, sample: f64) -> f64 {
        if self.latency_filter.len() == LATENCY_FILTER_SIZE {
            self.latency_filter.pop_front();
        }
        self.latency_filter.push_back(sample);
        let mut sorted: Vec<f64> = self.latency_filter.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted[sorted.len() / 2]
    }

    fn update_adjustment(&mut self, rtt: f64, dist_before_adjustment: f64) {
        if self.adjustment_window.len() == ADJUSTMENT_WINDOW_SIZE {
            self.adjustment_window.pop_front();
        }
        let applied = dist_before_adjustment + self.coord.adjustment;
        self.adjustment_window.push_back(rtt - applied);
        let avg: f64 =
            self.adjustment_window.iter().sum::<f64>() / self.adjustment_window.len() as f64;
        self.coord.adjustment += avg * 0.5;

        // Apply gravity: pull the height-adjustment term back toward zero
        // so a transient outlier doesn't permanently bias the coordinate.
        let gravity = euclidean_distance(&self.coord.vec, &self.origin.vec) / GRAVITY_RHO;
        self.coord.adjustment -= self.coord.adjustment.signum() * gravity * self.coord.adjustment.abs().min(1.0);
    }
}

impl Default for CoordinateClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_has_zero_distance_to_itself() {
        let a = Coordinate::origin();
        assert_eq!(a.distance_to(&a), Duration::from_secs_f64(HEIGHT_MIN * 2.0));
    }

    #[test]
    fn update_moves_coordinate_away_from_closer_peer() {
        let mut client = CoordinateClient::new();
        let mut peer = Coordinate::origin();
        peer.vec[0] = 1.0;

        for _ in 0..25 {
            client.update(&peer, Duration::from_millis(50));
        }
        assert_ne!(client.coordinate().vec, Coordinate::origin().vec);
    }

    #[test]
    fn invalid_remote_coordinate_triggers_a_reset() {
        let mut client = CoordinateClient::new();
        let mut bad = Coordinate::origin();
        bad.vec[0] = f64::NAN;
        client.update(&bad, Duration::from_millis(10));
        assert_eq!(client.resets(), 1);
        assert_eq!(client.coordinate().vec, Coordinate::origin().vec);
    }

    #[test]
    fn latency_filter_uses_the_median_of_recent_samples() {
        let mut client = CoordinateClient::new();
        let peer = Coordinate::origin();
        let samples = [0.01, 0.5, 0.02];
        let mut last = 0.0;
        for s in samples {
            last = client.filtered_rtt(s);
        }
        let _ = peer;
        assert_eq!(last, 0.02);
    }
}
