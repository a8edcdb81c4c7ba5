use std::fmt::Write as _;
use std::path::Path;

use gangway_state::GroupStatus;

use super::{OutputFormat, StatusError, format_duration_ms, format_timestamp_ms, load};

pub fn run(status_file: &Path, group_id: &str, format: OutputFormat) -> anyhow::Result<()> {
    let snapshot = load(status_file)?;
    let group = snapshot
        .find(group_id)
        .ok_or_else(|| StatusError::NotFound(group_id.to_string()))?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(group)?),
        OutputFormat::Text => {
            print!("{}", render(group));
            println!("As of:      {}", format_timestamp_ms(snapshot.generated_at_ms));
        }
    }
    Ok(())
}

fn render(g: &GroupStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Group:      {}", g.id);
    let _ = writeln!(out, "Queue:      {}", g.queue);
    let _ = writeln!(out, "Phase:      {} (for {})", g.phase, format_duration_ms(g.time_in_phase_ms));
    let _ = writeln!(out, "Priority:   {}", g.priority);
    let range = match g.max_member {
        Some(max) => format!("{}..{}", g.min_member, max),
        None => g.min_member.to_string(),
    };
    let _ = writeln!(out, "Members:    {} registered, {} bound (needs {range})", g.members, g.bound);
    if g.retry_count > 0 {
        let _ = writeln!(out, "Retries:    {}", g.retry_count);
    }
    if let Some(parent) = &g.parent {
        let gate = if g.gated_by_hierarchy {
            "waiting for sibling groups"
        } else {
            "not gated"
        };
        let _ = writeln!(out, "Parent:     {parent} ({gate})");
    }
    if let Some(reason) = &g.reason {
        let _ = writeln!(out, "Reason:     {reason}");
    }
    out
}
