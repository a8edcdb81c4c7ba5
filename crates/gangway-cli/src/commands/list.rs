use std::fmt::Write as _;
use std::path::Path;

use gangway_state::{GroupPhase, GroupStatus, StatusSnapshot};

use super::{OutputFormat, format_duration_ms, format_timestamp_ms, load};

pub fn run(
    status_file: &Path,
    phase: Option<GroupPhase>,
    queue: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let snapshot = load(status_file)?;
    let groups = filter(&snapshot, phase, queue);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
        OutputFormat::Text => print!("{}", render(&snapshot, &groups)),
    }
    Ok(())
}

pub fn filter<'a>(
    snapshot: &'a StatusSnapshot,
    phase: Option<GroupPhase>,
    queue: Option<&str>,
) -> Vec<&'a GroupStatus> {
    snapshot
        .groups
        .iter()
        .filter(|g| phase.is_none_or(|p| g.phase == p))
        .filter(|g| queue.is_none_or(|q| g.queue == q))
        .collect()
}

fn render(snapshot: &StatusSnapshot, groups: &[&GroupStatus]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<12} {:<10} {:>5} {:>9} {:>6} {:>8}  REASON",
        "GROUP", "QUEUE", "PHASE", "PRIO", "MEMBERS", "BOUND", "IN-PHASE"
    );
    for g in groups {
        let phase = if g.gated_by_hierarchy {
            format!("{}*", g.phase)
        } else {
            g.phase.to_string()
        };
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:<10} {:>5} {:>9} {:>6} {:>8}  {}",
            g.id,
            g.queue,
            phase,
            g.priority,
            format!("{}/{}", g.members, g.min_member),
            g.bound,
            format_duration_ms(g.time_in_phase_ms),
            g.reason.as_deref().unwrap_or("-"),
        );
    }
    let _ = writeln!(
        out,
        "\n{} groups, as of {}",
        groups.len(),
        format_timestamp_ms(snapshot.generated_at_ms)
    );
    if groups.iter().any(|g| g.gated_by_hierarchy) {
        let _ = writeln!(out, "* scheduled, waiting for sibling groups");
    }
    out
}
