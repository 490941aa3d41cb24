//! Plain-text rendering of query results for terminal output.

use crate::event::StoredEvent;
use crate::statistics::{ClassStatistics, WindowReport};
use crate::store::CollectionStats;
use std::fmt;

const RULE: &str = "============================================================";

fn write_counts(f: &mut fmt::Formatter<'_>, event: &StoredEvent) -> fmt::Result {
    let counts = &event.event.object_counts;
    if counts.is_empty() {
        return write!(f, "no objects");
    }
    for (position, (class, count)) in counts.iter().enumerate() {
        if position > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}: {}", class, count)?;
    }
    Ok(())
}

/// Newest events, one line each.
pub struct RecentView<'a>(pub &'a [StoredEvent]);

impl fmt::Display for RecentView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Recent detection events ({})", self.0.len())?;
        writeln!(f, "{}", RULE)?;
        if self.0.is_empty() {
            writeln!(f, "No events found")?;
        }
        for stored in self.0 {
            let event = &stored.event;
            write!(
                f,
                "{} | {} | frame {} (processed {}) | {} objects | ",
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.source_id,
                event.frame_number,
                event.processed_frame_number,
                event.total_objects_detected,
            )?;
            write_counts(f, stored)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Per-class statistics table.
pub struct ClassStatisticsView<'a> {
    pub stats: &'a [ClassStatistics],
    pub source_id: Option<&'a str>,
}

impl fmt::Display for ClassStatisticsView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        match self.source_id {
            Some(source) => writeln!(f, "Detection statistics for {}", source)?,
            None => writeln!(f, "Detection statistics (all sources)")?,
        }
        writeln!(f, "{}", RULE)?;
        if self.stats.is_empty() {
            return writeln!(f, "No detections stored");
        }
        writeln!(
            f,
            "{:<16} {:>8} {:>10} {:>10} {:>10}",
            "class", "count", "avg conf", "min conf", "max conf"
        )?;
        for entry in self.stats {
            writeln!(
                f,
                "{:<16} {:>8} {:>10.3} {:>10.3} {:>10.3}",
                entry.class_name,
                entry.total_count,
                entry.avg_confidence,
                entry.min_confidence,
                entry.max_confidence
            )?;
        }
        Ok(())
    }
}

/// Trailing-window event count and summed class totals.
pub struct WindowView<'a> {
    pub report: &'a WindowReport,
    pub hours: u32,
}

impl fmt::Display for WindowView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(
            f,
            "Events in the last {} hour(s): {}",
            self.hours,
            self.report.events.len()
        )?;
        writeln!(f, "{}", RULE)?;
        for (class, count) in self.report.ranked_totals() {
            writeln!(f, "  {}: {}", class, count)?;
        }
        Ok(())
    }
}

pub struct CollectionView<'a>(pub &'a CollectionStats);

impl fmt::Display for CollectionView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.0;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Database:  {}", stats.database_name)?;
        writeln!(f, "Table:     {}", stats.table_name)?;
        writeln!(f, "Documents: {}", stats.total_documents)?;
        writeln!(f, "Indexes:")?;
        for index in &stats.indexes {
            writeln!(f, "  {} ({})", index.name, index.definition)?;
        }
        writeln!(f, "{}", RULE)
    }
}

pub fn render_recent(events: &[StoredEvent]) -> String {
    RecentView(events).to_string()
}

pub fn render_class_statistics(stats: &[ClassStatistics], source_id: Option<&str>) -> String {
    ClassStatisticsView { stats, source_id }.to_string()
}

pub fn render_window(report: &WindowReport, hours: u32) -> String {
    WindowView { report, hours }.to_string()
}

pub fn render_collection(stats: &CollectionStats) -> String {
    CollectionView(stats).to_string()
}
