//! `list` output formats: table (runc-style column layout), json, and the
//! quiet id list.

use chrono::SecondsFormat;
use cradle_runtime::FullContainerState;

// Column layout values used by runc.
const MIN_WIDTH: usize = 12;
const PADDING: usize = 3;

pub fn render_quiet(rows: &[FullContainerState]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.state.id);
        out.push('\n');
    }
    out
}

pub fn render_json(rows: &[FullContainerState]) -> serde_json::Result<String> {
    serde_json::to_string(rows)
}

pub fn render_table(rows: &[FullContainerState], show_all: bool) -> String {
    let mut header = vec![
        "ID".to_string(),
        "PID".to_string(),
        "STATUS".to_string(),
        "BUNDLE".to_string(),
        "CREATED".to_string(),
        "OWNER".to_string(),
    ];
    if show_all {
        header.extend(
            ["HYPERVISOR", "KERNEL", "IMAGE", "LATEST-KERNEL", "LATEST-IMAGE", "STALE"]
                .map(String::from),
        );
    }

    let mut table = vec![header];
    for row in rows {
        let mut cells = vec![
            row.state.id.clone(),
            row.state.pid.to_string(),
            row.state.status.to_string(),
            row.state.bundle.display().to_string(),
            row.state
                .created
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            format!("#{}", row.state.owner),
        ];
        if show_all {
            let stale = if row.stale_assets.is_empty() {
                "-".to_string()
            } else {
                row.stale_assets.join(",")
            };
            cells.extend([
                row.current_hypervisor.hypervisor_path.display().to_string(),
                row.current_hypervisor.kernel_path.display().to_string(),
                row.current_hypervisor.image_path.display().to_string(),
                row.latest_hypervisor.kernel_path.display().to_string(),
                row.latest_hypervisor.image_path.display().to_string(),
                stale,
            ]);
        }
        table.push(cells);
    }

    layout(&table)
}

fn layout(table: &[Vec<String>]) -> String {
    let columns = table.iter().map(|row| row.len()).max().unwrap_or(0);
    let mut widths = vec![MIN_WIDTH; columns];
    for row in table {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len() + PADDING);
        }
    }

    let mut out = String::new();
    for row in table {
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == row.len() {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{:<width$}", cell, width = widths[i]));
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cradle_runtime::{ContainerState, HypervisorAssets, Status};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn sample_row(id: &str, stale: Vec<&str>) -> FullContainerState {
        let assets = HypervisorAssets {
            hypervisor_path: PathBuf::from("/usr/bin/qemu"),
            kernel_path: PathBuf::from("/usr/share/vmlinuz"),
            image_path: PathBuf::from("/usr/share/image.img"),
        };
        FullContainerState {
            state: ContainerState {
                oci_version: "1.0.2".to_string(),
                id: id.to_string(),
                pid: 1234,
                status: Status::Created,
                bundle: PathBuf::from("/bundles/a"),
                rootfs: PathBuf::from("/bundles/a/rootfs"),
                created: Utc::now(),
                annotations: HashMap::new(),
                owner: 0,
                vm_token: "tok".to_string(),
                sequences: vec![1, 2],
                hypervisor: assets.clone(),
            },
            current_hypervisor: assets.clone(),
            latest_hypervisor: assets,
            stale_assets: stale.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_quiet_is_ids_only() {
        let rows = vec![sample_row("a", vec![]), sample_row("b", vec![])];
        assert_eq!(render_quiet(&rows), "a\nb\n");
    }

    #[test]
    fn test_table_headers() {
        let rows = vec![sample_row("c1", vec![])];
        let table = render_table(&rows, false);
        let header = table.lines().next().unwrap();
        for col in ["ID", "PID", "STATUS", "BUNDLE", "CREATED", "OWNER"] {
            assert!(header.contains(col), "missing column {}", col);
        }
        assert!(!header.contains("STALE"));

        let body = table.lines().nth(1).unwrap();
        assert!(body.contains("c1"));
        assert!(body.contains("#0"));
    }

    #[test]
    fn test_show_all_adds_asset_columns_and_stale() {
        let rows = vec![sample_row("c1", vec!["kernel", "image"])];
        let table = render_table(&rows, true);
        let header = table.lines().next().unwrap();
        for col in ["HYPERVISOR", "LATEST-KERNEL", "LATEST-IMAGE", "STALE"] {
            assert!(header.contains(col), "missing column {}", col);
        }
        assert!(table.lines().nth(1).unwrap().ends_with("kernel,image"));

        let fresh = vec![sample_row("c2", vec![])];
        let table = render_table(&fresh, true);
        assert!(table.lines().nth(1).unwrap().ends_with('-'));
    }

    #[test]
    fn test_created_is_rfc3339_with_nanos() {
        let rows = vec![sample_row("c1", vec![])];
        let table = render_table(&rows, false);
        let body = table.lines().nth(1).unwrap();
        // Nanosecond fields keep a 9-digit fraction.
        assert!(body.contains('.') && body.contains('Z'));
    }

    #[test]
    fn test_json_carries_stale_assets() {
        let rows = vec![sample_row("c1", vec!["kernel"])];
        let json = render_json(&rows).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["staleAssets"][0], "kernel");
        assert!(value[0]["currentHypervisor"].is_object());
        assert!(value[0]["latestHypervisor"].is_object());
    }
}
