//! Running statistics of collector cycles for the `/health` endpoint.
//!
//! Per-cycle figures are kept over a sliding window of the latest cycles so
//! the table shows how the cache behaves now rather than since startup.
//! Counters are lifetime totals.

use std::collections::VecDeque;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Cycles kept in each series.
pub const WINDOW_CYCLES: usize = 60;

/// Summary of one series over its window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeriesSummary {
    pub last: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

/// The latest samples of one per-cycle figure.
#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<f64>,
}

impl Series {
    fn push(&mut self, value: f64) {
        if self.samples.len() == WINDOW_CYCLES {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn summary(&self) -> SeriesSummary {
        let Some(&last) = self.samples.back() else {
            return SeriesSummary::default();
        };
        let (min, max, sum) = self.samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        SeriesSummary {
            last,
            mean: sum / self.samples.len() as f64,
            min,
            max,
            samples: self.samples.len(),
        }
    }
}

#[derive(Debug, Default)]
struct CycleSeries {
    entities: Series,
    values: Series,
    required_bytes: Series,
    cycle_seconds: Series,
    tags_seconds: Series,
}

pub struct HealthStats {
    started: Instant,
    series: Mutex<CycleSeries>,
    total_cycles: AtomicU64,
    failed_cycles: AtomicU64,
    skipped_commits: AtomicU64,
    total_tag_cycles: AtomicU64,
    http_requests: AtomicU64,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            series: Mutex::new(CycleSeries::default()),
            total_cycles: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            skipped_commits: AtomicU64::new(0),
            total_tag_cycles: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
        }
    }
}

impl HealthStats {
    pub fn new() -> Self {
        Default::default()
    }

    fn series(&self) -> MutexGuard<'_, CycleSeries> {
        self.series.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one finished performance cycle.
    pub fn record_cycle(
        &self,
        entities: u64,
        values: u64,
        required_bytes: u64,
        duration_seconds: f64,
        skipped_commit: bool,
    ) {
        {
            let mut series = self.series();
            series.entities.push(entities as f64);
            series.values.push(values as f64);
            series.required_bytes.push(required_bytes as f64);
            series.cycle_seconds.push(duration_seconds);
        }
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        if skipped_commit {
            self.skipped_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a cycle that failed before commit.
    pub fn record_failed_cycle(&self) {
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tags_cycle(&self, duration_seconds: f64) {
        self.series().tags_seconds.push(duration_seconds);
        self.total_tag_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    pub fn failed_cycles(&self) -> u64 {
        self.failed_cycles.load(Ordering::Relaxed)
    }

    pub fn skipped_commits(&self) -> u64 {
        self.skipped_commits.load(Ordering::Relaxed)
    }

    pub fn http_requests(&self) -> u64 {
        self.http_requests.load(Ordering::Relaxed)
    }

    pub fn cycle_duration(&self) -> SeriesSummary {
        self.series().cycle_seconds.summary()
    }

    pub fn render_table(&self) -> String {
        let left_col = 26usize;
        let col_w = 12usize;

        let rows: [(&str, SeriesSummary, usize); 5] = {
            let series = self.series();
            [
                ("entities", series.entities.summary(), 0),
                ("values", series.values.summary(), 0),
                ("required bytes", series.required_bytes.summary(), 0),
                ("cycle duration (s)", series.cycle_seconds.summary(), 3),
                ("tags cycle duration (s)", series.tags_seconds.summary(), 3),
            ]
        };

        let mut out = String::new();
        writeln!(
            out,
            "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
            format!("last {} cycles", WINDOW_CYCLES),
            "last",
            "mean",
            "min",
            "max",
            left = left_col,
            col = col_w
        )
        .ok();
        writeln!(out, "{}", "-".repeat(left_col + 3 + (col_w + 3) * 4)).ok();

        for (name, summary, precision) in rows {
            writeln!(
                out,
                "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
                name,
                format!("{:.prec$}", summary.last, prec = precision),
                format!("{:.prec$}", summary.mean, prec = precision.max(1)),
                format!("{:.prec$}", summary.min, prec = precision),
                format!("{:.prec$}", summary.max, prec = precision),
                left = left_col,
                col = col_w
            )
            .ok();
        }

        writeln!(out).ok();
        writeln!(out, "number of done cycles: {}", self.total_cycles()).ok();
        writeln!(out, "failed cycles: {}", self.failed_cycles()).ok();
        writeln!(out, "skipped commits: {}", self.skipped_commits()).ok();
        writeln!(
            out,
            "number of done tag cycles: {}",
            self.total_tag_cycles.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(out, "uptime (s): {}", self.get_uptime_seconds()).ok();

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_window() {
        let mut series = Series::default();
        assert_eq!(series.summary(), SeriesSummary::default());

        series.push(2.0);
        series.push(6.0);
        series.push(4.0);
        let summary = series.summary();
        assert_eq!(summary.last, 4.0);
        assert_eq!(summary.mean, 4.0);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 6.0);
        assert_eq!(summary.samples, 3);

        // Old cycles fall out of the window.
        for _ in 0..WINDOW_CYCLES {
            series.push(1.0);
        }
        let summary = series.summary();
        assert_eq!(summary.samples, WINDOW_CYCLES);
        assert_eq!(summary.max, 1.0);
        assert_eq!(summary.mean, 1.0);
    }

    #[test]
    fn test_record_and_render() {
        let stats = HealthStats::new();
        stats.record_cycle(10, 120, 4096, 0.25, false);
        stats.record_cycle(12, 130, 8192, 0.5, true);
        stats.record_failed_cycle();
        stats.record_tags_cycle(0.1);

        assert_eq!(stats.total_cycles(), 3);
        assert_eq!(stats.failed_cycles(), 1);
        assert_eq!(stats.skipped_commits(), 1);
        assert_eq!(stats.cycle_duration().mean, 0.375);
        assert_eq!(stats.cycle_duration().samples, 2);

        let table = stats.render_table();
        assert!(table.contains("last 60 cycles"));
        assert!(table.contains("cycle duration (s)"));
        assert!(table.contains("number of done cycles: 3"));
        assert!(table.contains("skipped commits: 1"));
    }
}
