//! Cluster summary table with tabwriter alignment
//!
//! Every cell except the last one in a row is padded to the widest cell of
//! its column plus two spaces. The last column is appended unpadded, so a
//! row ends right after its final cell.

use tabled::builder::Builder;
use tabled::settings::{Padding, Style};

use crate::cluster::Cluster;

/// Column headers of the cluster summary view
pub const CLUSTER_COLUMNS: [&str; 6] = ["SERVER", "NAME", "VERSION", "STATUS", "MESSAGE", "PROJECT"];

fn cluster_row(cluster: &Cluster) -> [String; 6] {
    [
        cluster.server.clone(),
        cluster.name.clone(),
        cluster.server_version.clone().unwrap_or_default(),
        cluster.connection_state.status.to_string(),
        cluster.connection_state.message.clone(),
        cluster.project.clone(),
    ]
}

/// Render the cluster summary, one row per cluster, header always present
pub fn render_cluster_table(clusters: &[Cluster]) -> String {
    let rows: Vec<[String; 6]> = std::iter::once(CLUSTER_COLUMNS.map(String::from))
        .chain(clusters.iter().map(cluster_row))
        .map(|row| row.map(|cell| sanitize(&cell)))
        .collect();

    // tabled aligns the padded columns; the final one is joined per line
    let mut builder = Builder::default();
    for row in &rows {
        builder.push_record(row[..5].iter().cloned());
    }
    let mut table = builder.build();
    table.with(Style::empty()).with(Padding::new(0, 2, 0, 0));

    table
        .to_string()
        .lines()
        .zip(&rows)
        .map(|(aligned, row)| format!("{}{}", aligned, row[5]))
        .collect::<Vec<_>>()
        .join("\n")
}

fn sanitize(cell: &str) -> String {
    cell.replace(['\n', '\r', '\t'], " ")
}
