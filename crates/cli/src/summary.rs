//! Rendering of sync reports and status tables.

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use wikisync_core::models::{ActionKind, ExitStatus, PageRecord, SyncReport};
use wikisync_core::sync_engine::LocalStatus;

use crate::style;

/// Counts per category, one row each; zero rows are left out.
pub fn report_table(report: &SyncReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Category", "Pages"]);

    let rows = [
        ("Unchanged", report.unchanged),
        ("Pushed", report.pushed),
        ("Pulled", report.pulled),
        ("Created remotely", report.created_remote),
        ("Created locally", report.created_local),
        ("Merged", report.merged),
        ("Deleted", report.deletions.succeeded.len()),
        ("Moved", report.moves.succeeded.len()),
    ];
    for (label, count) in rows.into_iter().filter(|(_, n)| *n > 0) {
        table.add_row(vec![Cell::new(label), Cell::new(count)]);
    }
    if !report.conflicts.is_empty() {
        table.add_row(vec![
            Cell::new("Conflicts").fg(Color::Yellow),
            Cell::new(report.conflicts.len()).fg(Color::Yellow),
        ]);
    }
    let failed = report.failures.len() + report.deletions.failed.len() + report.moves.failed.len();
    if failed > 0 {
        table.add_row(vec![
            Cell::new("Failed").fg(Color::Red),
            Cell::new(failed).fg(Color::Red),
        ]);
    }
    table
}

/// Planned actions of a dry run.
pub fn actions_table(report: &SyncReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Action", "Page", "Detail"]);
    for action in &report.actions {
        table.add_row(vec![
            action_cell(action.kind),
            Cell::new(&action.target),
            Cell::new(&action.detail),
        ]);
    }
    table
}

fn action_cell(kind: ActionKind) -> Cell {
    let (label, color) = match kind {
        ActionKind::Push => ("push", Color::Green),
        ActionKind::Pull => ("pull", Color::Blue),
        ActionKind::CreateRemote => ("create remote", Color::Green),
        ActionKind::CreateLocal => ("create local", Color::Blue),
        ActionKind::Merge => ("merge", Color::Cyan),
        ActionKind::Conflict => ("conflict", Color::Yellow),
        ActionKind::DeleteLocal => ("delete local", Color::Red),
        ActionKind::TrashRemote => ("trash remote", Color::Red),
        ActionKind::MoveLocal => ("move local", Color::Magenta),
        ActionKind::MoveRemote => ("move remote", Color::Magenta),
    };
    Cell::new(label).fg(color)
}

/// Print a report: counts, then dry-run actions, failures and conflicts.
pub fn print_report(report: &SyncReport, show_diff: bool) {
    println!();
    let title = if report.dry_run {
        format!("Dry run ({})", report.mode)
    } else {
        format!("Sync complete ({})", report.mode)
    };
    println!("{}", style::header(&title));
    println!("{}", report_table(report));

    if report.dry_run && !report.actions.is_empty() {
        println!();
        println!("{}", style::header(&format!("Planned actions ({})", report.actions.len())));
        println!("{}", actions_table(report));
        if show_diff {
            for action in report.actions.iter().filter(|a| a.preview.is_some()) {
                println!();
                println!("{}", style::dim(&format!("{} {}", action.detail, action.target)));
                println!("{}", style::diff(action.preview.as_deref().unwrap_or_default()));
            }
        }
    }

    let failures = report
        .failures
        .iter()
        .chain(&report.deletions.failed)
        .chain(&report.moves.failed);
    for failure in failures {
        println!("{}", style::error(&format!("{}: {}", failure.page_id, failure.error)));
    }
    for id in &report.conflicts {
        println!("{}", style::warn(&format!("page {} has unresolved conflicts", id)));
    }

    println!();
    match report.exit_status() {
        ExitStatus::Clean => println!("{}", style::success("Nothing left to do")),
        ExitStatus::Conflicts => println!(
            "{}",
            style::warn("Resolve the conflict markers, then run `wikisync sync` again")
        ),
        ExitStatus::Failed => println!("{}", style::error("Some pages failed; see above")),
    }
}

pub fn status_table(status: &LocalStatus) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["State", "File"]);
    let groups = [
        ("modified", Color::Green, &status.modified),
        ("new", Color::Cyan, &status.new_files),
        ("missing", Color::Red, &status.missing),
        ("conflict", Color::Yellow, &status.conflicts),
    ];
    for (label, color, paths) in groups {
        for path in paths {
            table.add_row(vec![
                Cell::new(label).fg(color),
                Cell::new(path.display()),
            ]);
        }
    }
    table
}

pub fn conflicts_table(records: &[PageRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Page", "Title", "File", "Remote version", "Detected"]);
    for record in records {
        let Some(pending) = &record.pending_conflict else {
            continue;
        };
        table.add_row(vec![
            Cell::new(&record.page_id),
            Cell::new(&record.title),
            Cell::new(record.local_path.display()),
            Cell::new(pending.remote_version),
            Cell::new(pending.detected_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use wikisync_core::models::ItemFailure;

    #[test]
    fn test_report_table_skips_empty_categories() {
        let report = SyncReport {
            pushed: 2,
            pulled: 1,
            conflicts: vec!["10".into()],
            failures: vec![ItemFailure {
                page_id: "11".into(),
                error: "boom".into(),
            }],
            ..Default::default()
        };
        let rendered = report_table(&report).to_string();
        assert!(rendered.contains("Pushed"));
        assert!(rendered.contains("Pulled"));
        assert!(rendered.contains("Conflicts"));
        assert!(rendered.contains("Failed"));
        assert!(!rendered.contains("Merged"));
    }

    #[test]
    fn test_actions_table_lists_every_action() {
        let mut report = SyncReport {
            dry_run: true,
            ..Default::default()
        };
        report.plan(ActionKind::TrashRemote, "12", "move remote page to trash");
        report.plan(ActionKind::CreateLocal, "13", "guide/tips.md");
        let rendered = actions_table(&report).to_string();
        assert!(rendered.contains("trash remote"));
        assert!(rendered.contains("guide/tips.md"));
    }
}
