//! Peer-specific score of a candidate status.
//!
//! ```text
//!   score = (w_r * relevance + w_d * density + w_q * quality) * age
//! ```
//!
//! and 0 whenever the contact has not joined the status's group.

use murmur_core::{Contact, ScoringWeights};

use crate::density::ReplicationDensityWatcher;
use crate::storage::StatusRecord;

/// The terms a score is made of.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ScoreBreakdown {
    pub relevance: f32,
    pub density: f32,
    pub quality: f32,
    pub age: f32,
    pub total: f32,
}

impl ScoreBreakdown {
    const ZERO: ScoreBreakdown = ScoreBreakdown {
        relevance: 0.0,
        density: 0.0,
        quality: 0.0,
        age: 0.0,
        total: 0.0,
    };
}

/// Score `record` for `contact`. Pure: the density is passed in.
pub fn breakdown(
    record: &StatusRecord,
    contact: &Contact,
    density: f32,
    now_ms: u64,
    weights: &ScoringWeights,
    max_interest: u8,
) -> ScoreBreakdown {
    let status = &record.status;
    if !contact.groups.contains(&status.group) {
        return ScoreBreakdown::ZERO;
    }

    let relevance = relevance(&status.hashtags(), contact, max_interest);
    let quality = if record.duplicate == 0 {
        0.0
    } else {
        status.like as f32 / record.duplicate as f32
    };
    let age = if status.ttl <= 0 {
        1.0
    } else {
        let elapsed = now_ms.saturating_sub(status.created_at) as f32 / 1000.0;
        (1.0 - elapsed / status.ttl as f32).max(0.0)
    };
    let density = density.clamp(0.0, 1.0);

    let total = (weights.relevance * relevance + weights.density * density + weights.quality * quality)
        * age;
    ScoreBreakdown {
        relevance,
        density,
        quality,
        age,
        total: total.max(0.0),
    }
}

fn relevance(
    hashtags: &std::collections::BTreeSet<String>,
    contact: &Contact,
    max_interest: u8,
) -> f32 {
    if max_interest == 0 {
        return 0.0;
    }
    let (matched, weight) = hashtags
        .iter()
        .filter_map(|tag| contact.interests.get(tag))
        .fold((0u32, 0u32), |(n, w), level| (n + 1, w + u32::from(*level)));
    if matched == 0 {
        return 0.0;
    }
    weight as f32 / (matched as f32 * f32::from(max_interest))
}

/// Scoring bound to the live density counters.
#[derive(Clone)]
pub struct ScoringFunction {
    weights: ScoringWeights,
    max_interest: u8,
    watcher: ReplicationDensityWatcher,
}

impl ScoringFunction {
    pub fn new(weights: ScoringWeights, max_interest: u8, watcher: ReplicationDensityWatcher) -> Self {
        Self {
            weights,
            max_interest,
            watcher,
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, record: &StatusRecord, contact: &Contact, now_ms: u64) -> f32 {
        self.breakdown(record, contact, now_ms).total
    }

    pub fn breakdown(&self, record: &StatusRecord, contact: &Contact, now_ms: u64) -> ScoreBreakdown {
        let density = self.watcher.density(&record.status.id);
        breakdown(record, contact, density, now_ms, &self.weights, self.max_interest)
    }
}
