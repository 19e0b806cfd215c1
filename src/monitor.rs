//! Query performance monitoring.
//!
//! Keeps a bounded ring of query records and aggregates latency and hit
//! statistics over a time window. Recording failures must never affect the
//! query path, so every entry point is infallible.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::config::QueryMonitoringConfig;
use crate::types::now_secs;

/// One tracked query execution.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub id: String,
    pub timestamp: f64,
    pub query: String,
    pub processing_time_ms: f64,
    pub total_results: usize,
    pub collections_searched: Vec<String>,
    pub smart_routing_used: bool,
    pub related_chunks_included: usize,
    pub effective_k: usize,
}

/// Aggregate performance over a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSummary {
    pub window: String,
    pub query_count: usize,
    pub avg_processing_time_ms: f64,
    pub min_processing_time_ms: f64,
    pub max_processing_time_ms: f64,
    pub avg_results_per_query: f64,
    pub smart_routing_rate: f64,
    pub related_chunks_total: usize,
}

/// Time windows accepted by the summary API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    Hour,
    Day,
    Week,
    All,
}

impl TimeWindow {
    pub fn parse(name: &str) -> TimeWindow {
        match name {
            "hour" => TimeWindow::Hour,
            "day" => TimeWindow::Day,
            "week" => TimeWindow::Week,
            _ => TimeWindow::All,
        }
    }

    fn cutoff(self, now: f64) -> f64 {
        match self {
            TimeWindow::Hour => now - 3600.0,
            TimeWindow::Day => now - 86_400.0,
            TimeWindow::Week => now - 604_800.0,
            TimeWindow::All => f64::MIN,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
            TimeWindow::Week => "week",
            TimeWindow::All => "all",
        }
    }
}

/// Bounded query-history monitor.
pub struct QueryPerformanceMonitor {
    history_size: usize,
    history: Mutex<VecDeque<QueryRecord>>,
    start_time: f64,
}

impl QueryPerformanceMonitor {
    pub fn new(config: &QueryMonitoringConfig) -> Self {
        QueryPerformanceMonitor {
            history_size: config.history_size.max(1),
            history: Mutex::new(VecDeque::with_capacity(config.history_size.min(1024))),
            start_time: now_secs(),
        }
    }

    /// Record a query execution. Returns the tracking id.
    #[allow(clippy::too_many_arguments)]
    pub fn track_query(
        &self,
        query: &str,
        total_results: usize,
        collections_searched: &[String],
        smart_routing_used: bool,
        related_chunks_included: usize,
        effective_k: usize,
        processing_time_ms: f64,
    ) -> String {
        let now = now_secs();
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let id = format!("q_{}_{}", (now * 1000.0) as i64, history.len());

        history.push_back(QueryRecord {
            id: id.clone(),
            timestamp: now,
            query: query.to_string(),
            processing_time_ms,
            total_results,
            collections_searched: collections_searched.to_vec(),
            smart_routing_used,
            related_chunks_included,
            effective_k,
        });
        while history.len() > self.history_size {
            history.pop_front();
        }
        id
    }

    /// Aggregate summary over a time window.
    pub fn performance_summary(&self, window: TimeWindow) -> PerformanceSummary {
        let now = now_secs();
        let cutoff = window.cutoff(now);
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());

        let records: Vec<&QueryRecord> =
            history.iter().filter(|r| r.timestamp >= cutoff).collect();

        if records.is_empty() {
            return PerformanceSummary {
                window: window.name().to_string(),
                ..Default::default()
            };
        }

        let times: Vec<f64> = records.iter().map(|r| r.processing_time_ms).collect();
        let total_results: usize = records.iter().map(|r| r.total_results).sum();
        let smart: usize = records.iter().filter(|r| r.smart_routing_used).count();
        let related: usize = records.iter().map(|r| r.related_chunks_included).sum();

        PerformanceSummary {
            window: window.name().to_string(),
            query_count: records.len(),
            avg_processing_time_ms: times.iter().sum::<f64>() / times.len() as f64,
            min_processing_time_ms: times.iter().copied().fold(f64::INFINITY, f64::min),
            max_processing_time_ms: times.iter().copied().fold(0.0, f64::max),
            avg_results_per_query: total_results as f64 / records.len() as f64,
            smart_routing_rate: smart as f64 / records.len() as f64,
            related_chunks_total: related,
        }
    }

    /// Seconds the monitor has been alive.
    pub fn uptime_secs(&self) -> f64 {
        now_secs() - self.start_time
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for QueryPerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPerformanceMonitor")
            .field("records", &self.len())
            .field("capacity", &self.history_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(capacity: usize) -> QueryPerformanceMonitor {
        QueryPerformanceMonitor::new(&QueryMonitoringConfig {
            history_size: capacity,
        })
    }

    fn track(m: &QueryPerformanceMonitor, query: &str, results: usize, smart: bool, ms: f64) {
        m.track_query(query, results, &["short_term".to_string()], smart, 0, 5, ms);
    }

    #[test]
    fn test_track_and_summarize() {
        let m = monitor(100);
        track(&m, "first", 3, true, 12.0);
        track(&m, "second", 1, false, 8.0);

        let summary = m.performance_summary(TimeWindow::All);
        assert_eq!(summary.query_count, 2);
        assert!((summary.avg_processing_time_ms - 10.0).abs() < 1e-9);
        assert!((summary.min_processing_time_ms - 8.0).abs() < 1e-9);
        assert!((summary.max_processing_time_ms - 12.0).abs() < 1e-9);
        assert!((summary.avg_results_per_query - 2.0).abs() < 1e-9);
        assert!((summary.smart_routing_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let m = monitor(5);
        for i in 0..20 {
            track(&m, &format!("q{i}"), 1, false, 1.0);
        }
        assert_eq!(m.len(), 5);
    }

    #[test]
    fn test_empty_summary() {
        let m = monitor(10);
        let summary = m.performance_summary(TimeWindow::Day);
        assert_eq!(summary.query_count, 0);
        assert_eq!(summary.window, "day");
    }

    #[test]
    fn test_window_parse() {
        assert_eq!(TimeWindow::parse("hour"), TimeWindow::Hour);
        assert_eq!(TimeWindow::parse("week"), TimeWindow::Week);
        assert_eq!(TimeWindow::parse("anything"), TimeWindow::All);
    }
}
