//! Execution Timeline
//!
//! Renders node start offsets and durations as an ASCII Gantt chart for the
//! post-run report.

/// Width of the bar area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the label column.
const LABEL_WIDTH: usize = 20;

/// One executed node on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub label: String,
    /// Milliseconds since the run started
    pub start_ms: u64,
    pub duration_ms: u64,
    pub failed: bool,
}

/// Collected timing rows of a run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    entries: Vec<TimelineEntry>,
    total_ms: u64,
}

impl ExecutionTimeline {
    /// Creates an empty timeline for a run of the given length.
    pub fn new(total_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            total_ms,
        }
    }

    pub fn add(&mut self, entry: TimelineEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Each executed node is a bar positioned at its start offset and scaled
    /// against the total run time. Failed nodes are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self
            .entries
            .iter()
            .map(|e| e.start_ms + e.duration_ms)
            .max()
            .unwrap_or(0)
            .max(self.total_ms);

        if total == 0 || self.entries.is_empty() {
            return output;
        }

        let scale = CHART_WIDTH / total as f64;

        let mut sorted: Vec<&TimelineEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.start_ms);

        for entry in sorted {
            let start_pos = (entry.start_ms as f64 * scale) as usize;
            let length = (entry.duration_ms as f64 * scale).max(1.0) as usize;
            let mark = if entry.failed { "x" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(length));

            output.push_str(&format!(
                "{} |{:<width$}| ({} ms)\n",
                truncate(&entry.label, LABEL_WIDTH),
                bar,
                entry.duration_ms,
                width = CHART_WIDTH as usize + 1
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
