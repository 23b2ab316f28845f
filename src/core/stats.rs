/*
 * FlashLaunch Core
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::telemetry::DispatchTelemetry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub total_dispatches: u64,
    pub total_results: u64,
    pub cancelled_dispatches: u64,
    pub total_elapsed_ms: u64,
    /// Failure count per plugin key
    pub plugin_failures: BTreeMap<String, u64>,
    pub last_dispatch: Option<DateTime<Utc>>,
}

impl DispatchStats {
    pub fn average_elapsed_ms(&self) -> u64 {
        self.total_elapsed_ms
            .checked_div(self.total_dispatches)
            .unwrap_or(0)
    }
}

pub type StatsState = Arc<RwLock<DispatchStats>>;

pub fn create_stats_state() -> StatsState {
    Arc::new(RwLock::new(DispatchStats::default()))
}

pub async fn record_dispatch(stats: &StatsState, telemetry: &DispatchTelemetry) {
    let mut stats_guard = stats.write().await;

    stats_guard.total_dispatches += 1;
    stats_guard.total_results += telemetry.result_count as u64;
    stats_guard.total_elapsed_ms += telemetry.elapsed_ms;
    stats_guard.last_dispatch = Some(Utc::now());

    for plugin in &telemetry.failed_plugins {
        *stats_guard.plugin_failures.entry(plugin.clone()).or_insert(0) += 1;
    }
}

pub async fn record_cancelled(stats: &StatsState) {
    let mut stats_guard = stats.write().await;
    stats_guard.cancelled_dispatches += 1;
    stats_guard.last_dispatch = Some(Utc::now());
}

pub async fn get_stats(stats: &StatsState) -> DispatchStats {
    stats.read().await.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_record_dispatch_accumulates() {
        let stats = create_stats_state();

        let first = DispatchTelemetry::new("a", Duration::from_millis(10), 2)
            .with_results(3)
            .with_failures(vec!["broken".to_string()]);
        let second = DispatchTelemetry::new("ab", Duration::from_millis(30), 2)
            .with_results(1)
            .with_failures(vec!["broken".to_string()]);

        record_dispatch(&stats, &first).await;
        record_dispatch(&stats, &second).await;
        record_cancelled(&stats).await;

        let snapshot = get_stats(&stats).await;
        assert_eq!(snapshot.total_dispatches, 2);
        assert_eq!(snapshot.total_results, 4);
        assert_eq!(snapshot.cancelled_dispatches, 1);
        assert_eq!(snapshot.average_elapsed_ms(), 20);
        assert_eq!(snapshot.plugin_failures.get("broken"), Some(&2));
        assert!(snapshot.last_dispatch.is_some());
    }

    #[test]
    fn test_average_with_no_dispatches() {
        assert_eq!(DispatchStats::default().average_elapsed_ms(), 0);
    }
}
