//! Plain-text rendering of a group's status

use std::fmt::Write;

use crate::job::JobSnapshot;
use crate::range::RangeStop;
use crate::types::{GroupState, JobState};

/// Everything the summary shows
#[derive(Clone, Debug)]
pub struct GroupView {
    /// Members in display order
    pub members: Vec<JobSnapshot>,
    /// Sources asked for
    pub requested: usize,
    /// Boundary that cut a range short
    pub boundary: Option<RangeStop>,
}

impl GroupView {
    /// Replace the member with the snapshot's id; unknown ids are ignored
    ///
    /// Returns whether anything changed.
    pub fn apply(&mut self, snapshot: JobSnapshot) -> bool {
        match self.members.iter_mut().find(|m| m.id == snapshot.id) {
            Some(member) if *member != snapshot => {
                *member = snapshot;
                true
            }
            _ => false,
        }
    }

    /// Aggregate of the member states
    pub fn state(&self) -> GroupState {
        GroupState::aggregate(self.members.iter().map(|m| &m.state))
    }

    /// Members that succeeded
    pub fn succeeded(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state == JobState::Succeeded)
            .count()
    }

    /// Whether every member is terminal
    pub fn is_finished(&self) -> bool {
        self.members.iter().all(|m| m.state.is_terminal())
    }
}

/// Human-readable size with one decimal
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn render_member(out: &mut String, member: &JobSnapshot) {
    let _ = write!(out, "{}. {} - {}", member.position + 1, member.label, member.state);
    match member.state {
        JobState::Uploading | JobState::Fetching | JobState::Finalizing => {
            match (member.percent(), member.bytes_total) {
                (Some(pct), Some(total)) => {
                    let _ = write!(
                        out,
                        " {pct}% ({} / {})",
                        format_bytes(member.bytes_transferred),
                        format_bytes(total)
                    );
                }
                _ if member.bytes_transferred > 0 => {
                    let _ = write!(out, " ({})", format_bytes(member.bytes_transferred));
                }
                _ => {}
            }
        }
        JobState::Succeeded => {
            if let Some(total) = member.bytes_total {
                let _ = write!(out, " ({})", format_bytes(total));
            }
        }
        JobState::Failed => {
            if let Some(error) = &member.error {
                let _ = write!(out, ": {error}");
            }
        }
        JobState::Queued | JobState::Canceled => {}
    }
    out.push('\n');
}

/// Render the status summary
///
/// Lists at most `max_listed` members; the rest are counted by state.
pub fn render(view: &GroupView, max_listed: usize) -> String {
    let mut out = String::new();
    let total = view.members.len();

    let _ = writeln!(
        out,
        "Transfer {}: {}/{} succeeded",
        view.state(),
        view.succeeded(),
        total
    );

    for member in view.members.iter().take(max_listed) {
        render_member(&mut out, member);
    }

    if total > max_listed {
        let hidden = &view.members[max_listed..];
        let done = hidden.iter().filter(|m| m.state.is_terminal()).count();
        let _ = writeln!(
            out,
            "... and {} more ({} finished)",
            hidden.len(),
            done
        );
    }

    if view.requested > total {
        let _ = write!(out, "{} of {} admitted", total, view.requested);
        if let Some(boundary) = &view.boundary {
            let _ = write!(out, " ({boundary})");
        }
        out.push('\n');
    }

    out.trim_end().to_string()
}
