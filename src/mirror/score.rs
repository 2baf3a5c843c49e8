// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Historical node performance.
//!
//! Each mirror node accumulates [`NodeStats`] across runs. The composite
//! score favors reliability first, then speed of past successful clones, then
//! how recently the node was used:
//!
//! ```text
//! score = 0.6 * reliability + 0.3 * exp(-avg_ms / 5000) + 0.1 * exp(-days / 7)
//! ```
//!
//! Nodes without any record score zero, so known-good nodes are re-validated
//! before unknown ones are explored.

use crate::store::{JsonStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;

const STATS_KEY: &str = "runtime.node_stats";

const RELIABILITY_WEIGHT: f64 = 0.6;
const SPEED_WEIGHT: f64 = 0.3;
const RECENCY_WEIGHT: f64 = 0.1;
const SPEED_SCALE_MS: f64 = 5000.0;
const RECENCY_SCALE_DAYS: f64 = 7.0;

/// Persisted performance record of one node.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_success_time_ms: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl NodeStats {
    fn attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }

    fn record(&mut self, success: bool, duration: Duration, now: DateTime<Utc>) {
        if success {
            self.success_count += 1;
            let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            self.total_success_time_ms = self.total_success_time_ms.saturating_add(millis);
        } else {
            self.failure_count += 1;
        }
        self.last_used = Some(now);
    }
}

/// Compute composite score of optional record at time `now`.
///
/// Always within `[0, 1]`.
pub fn score(stats: Option<&NodeStats>, now: DateTime<Utc>) -> f64 {
    let Some(stats) = stats else {
        return 0.0;
    };

    let attempts = stats.attempts();
    if attempts == 0 {
        return 0.5;
    }

    let reliability = stats.success_count as f64 / attempts as f64;
    let speed = if stats.success_count == 0 {
        0.0
    } else {
        let average_ms = stats.total_success_time_ms as f64 / stats.success_count as f64;
        (-average_ms / SPEED_SCALE_MS).exp()
    };
    let recency = match stats.last_used {
        Some(last_used) => {
            let days = (now - last_used).num_milliseconds().max(0) as f64 / 86_400_000.0;
            (-days / RECENCY_SCALE_DAYS).exp()
        }
        None => 0.5,
    };

    let composite = RELIABILITY_WEIGHT * reliability + SPEED_WEIGHT * speed + RECENCY_WEIGHT * recency;
    composite.clamp(0.0, 1.0)
}

/// Score nodes from persisted statistics.
#[derive(Debug, Clone)]
pub struct NodeScorer {
    store: Arc<JsonStore>,
}

impl NodeScorer {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self { store }
    }

    /// Score node by name.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if statistics cannot be read.
    pub fn score(&self, name: &str) -> Result<f64> {
        let stats = self.stats(name)?;
        Ok(score(stats.as_ref(), Utc::now()))
    }

    /// Statistics of node by name, if any were ever recorded.
    pub fn stats(&self, name: &str) -> Result<Option<NodeStats>> {
        let mut all: BTreeMap<String, NodeStats> = self.store.get(STATS_KEY, BTreeMap::new())?;
        Ok(all.remove(name))
    }

    /// Record outcome of one attempt against node.
    ///
    /// Duration only accumulates on success.
    pub fn update_stats(&self, name: &str, success: bool, duration: Duration) -> Result<()> {
        let now = Utc::now();
        self.store.update(STATS_KEY, BTreeMap::<String, NodeStats>::new(), |all| {
            all.entry(name.to_string())
                .or_default()
                .record(success, duration, now);
        })?;
        debug!("recorded {} attempt for node {name}", if success { "successful" } else { "failed" });

        Ok(())
    }
}

type Result<T, E = StoreError> = std::result::Result<T, E>;
