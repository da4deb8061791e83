//! Markdown report generation.
//!
//! [`MarkdownGenerator`] renders a [`Report`] as a document a learner or a
//! grown-up can read: a summary table, the milestone table, earned badges and
//! the session timeline.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::{MilestoneReport, Report, TimelineEntry};

/// Maximum length of timeline details before truncation.
const MAX_DETAILS_DISPLAY_LENGTH: usize = 120;

/// Renders a [`Report`] as Markdown.
pub struct MarkdownGenerator<'a> {
    report: &'a Report,
}

impl<'a> MarkdownGenerator<'a> {
    /// Creates a new Markdown generator for the given report.
    #[must_use]
    pub const fn new(report: &'a Report) -> Self {
        Self { report }
    }

    /// Generates the complete Markdown report.
    #[must_use]
    pub fn generate(&self) -> String {
        let mut output = String::new();

        self.write_title(&mut output);
        self.write_summary(&mut output);
        self.write_milestones(&mut output);
        self.write_badges(&mut output);
        self.write_timeline(&mut output);
        Self::write_footer(&mut output);

        output
    }

    fn write_title(&self, output: &mut String) {
        let title = self
            .report
            .lesson_title
            .as_deref()
            .unwrap_or(&self.report.theme);
        let _ = writeln!(output, "# Tutor Session Report: {}\n", escape_markdown(title));
        let _ = writeln!(
            output,
            "Learner: **{}** | Theme: {}\n",
            escape_markdown(&self.report.learner_nickname),
            escape_markdown(&self.report.theme)
        );
    }

    fn write_summary(&self, output: &mut String) {
        let summary = &self.report.summary;

        let _ = writeln!(output, "## Summary\n");
        let _ = writeln!(output, "| Metric | Value |");
        let _ = writeln!(output, "|--------|-------|");
        let _ = writeln!(output, "| Status | {} |", summary.phase.description());
        let _ = writeln!(
            output,
            "| Milestones | {} of {} ({}%) |",
            summary.milestones_completed,
            summary.total_milestones,
            summary.completion_percent()
        );
        let _ = writeln!(output, "| XP Earned | {} |", summary.xp_earned);
        let _ = writeln!(
            output,
            "| Attempts | {} ({} passed) |",
            summary.attempts, summary.passed_attempts
        );
        let _ = writeln!(output, "| Hints Used | {} |", summary.hints_used);
        let _ = writeln!(output, "| Difficulty | {} |", summary.difficulty_level);
        let _ = writeln!(
            output,
            "| Duration | {} |",
            format_duration(summary.duration_seconds)
        );
        if summary.ended_early {
            let _ = writeln!(output, "| Ended Early | yes |");
        }
        let _ = writeln!(output);
    }

    fn write_milestones(&self, output: &mut String) {
        let _ = writeln!(output, "## Milestones\n");

        if self.report.milestones.is_empty() {
            let _ = writeln!(output, "*No milestones were planned.*\n");
            return;
        }

        let _ = writeln!(output, "| # | Goal | Status | Attempts | Hints | XP |");
        let _ = writeln!(output, "|---|------|--------|----------|-------|----|");
        for milestone in &self.report.milestones {
            Self::write_milestone_row(output, milestone);
        }
        let _ = writeln!(output);
    }

    fn write_milestone_row(output: &mut String, milestone: &MilestoneReport) {
        let position = milestone.position;
        let goal = escape_markdown(&milestone.goal);
        let status = milestone.status.label();
        let attempts = milestone.attempts;
        let hints = milestone.hints_used;
        let xp = milestone.xp_earned;
        let _ = writeln!(
            output,
            "| {position} | {goal} | {status} | {attempts} | {hints} | {xp} |"
        );
    }

    fn write_badges(&self, output: &mut String) {
        let _ = writeln!(output, "## Badges\n");

        let badges = &self.report.summary.badges_earned;
        if badges.is_empty() {
            let _ = writeln!(output, "*No badges earned yet.*\n");
            return;
        }

        for badge in badges {
            let _ = writeln!(output, "- {}", escape_markdown(badge));
        }
        let _ = writeln!(output);
    }

    fn write_timeline(&self, output: &mut String) {
        let _ = writeln!(output, "## Timeline\n");

        if self.report.timeline.is_empty() {
            let _ = writeln!(output, "*No events recorded.*\n");
            return;
        }

        let _ = writeln!(output, "| Time | Milestone | Event | Details |");
        let _ = writeln!(output, "|------|-----------|-------|---------|");
        for entry in &self.report.timeline {
            Self::write_timeline_entry(output, entry);
        }
        let _ = writeln!(output);
    }

    fn write_timeline_entry(output: &mut String, entry: &TimelineEntry) {
        let time = format_timestamp(&entry.timestamp);
        let milestone = entry
            .milestone_id
            .as_deref()
            .map_or_else(|| "-".to_string(), escape_markdown);
        let event = escape_markdown(&entry.event);
        let details = entry.details.as_deref().map_or_else(
            || "-".to_string(),
            |d| escape_markdown(&truncate(d, MAX_DETAILS_DISPLAY_LENGTH)),
        );
        let _ = writeln!(output, "| {time} | {milestone} | {event} | {details} |");
    }

    fn write_footer(output: &mut String) {
        let _ = writeln!(output, "---");
        let timestamp = format_timestamp(&Utc::now());
        let _ = writeln!(output, "*Generated by Milestone Tutor at {timestamp}*");
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Formats seconds as e.g. "1h 1m 1s", "1m 5s" or "45s".
fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();

    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }

    parts.join(" ")
}

/// Format: "YYYY-MM-DD HH:MM:SS UTC"
fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Escapes characters that Markdown would interpret as formatting.
fn escape_markdown(text: &str) -> String {
    let mut result = String::with_capacity(text.len());

    for ch in text.chars() {
        match ch {
            '*' | '_' | '`' | '#' | '[' | ']' | '(' | ')' | '!' | '\\' | '<' | '>' | '|' => {
                result.push('\\');
                result.push(ch);
            }
            // Table cells cannot contain raw newlines
            '\n' => result.push_str("<br>"),
            _ => result.push(ch),
        }
    }

    result
}

/// Truncates to `max_chars` characters, adding an ellipsis.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...")
}

// ============================================================================
// Tests
// ============================================================================
