use std::fmt::Display;

use asset_serde::ownership::{AggregationRow, BusinessUnitRow, Distribution, OwnershipReport};
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::*;

pub const NO_DATA: &str = "no data available";

pub fn as_ascii_table<T, U, V, W>(headers: T, rows: U) -> String
where
    T: IntoIterator,
    T::Item: AsRef<str> + Display,
    U: IntoIterator<Item = V>,
    V: IntoIterator<Item = W>,
    W: AsRef<str> + Display,
{
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers);
    table.add_rows(rows);
    table.to_string()
}

fn distribution_table(title: &str, distribution: &Distribution<AggregationRow>) -> String {
    if distribution.is_empty() {
        return format!("{title}: {NO_DATA}");
    }
    let rows = distribution.rows.iter().map(|row| {
        vec![
            row.group_key.clone(),
            row.total_assets.to_string(),
            row.unowned_assets.to_string(),
        ]
    });
    format!(
        "{title}\n{}",
        as_ascii_table([title, "Total", "Unowned"], rows)
    )
}

fn business_unit_table(distribution: &Distribution<BusinessUnitRow>) -> String {
    if distribution.is_empty() {
        return format!("BU / MBU: {NO_DATA}");
    }
    let rows = distribution.rows.iter().map(|row| {
        vec![
            row.bu.clone(),
            row.mbu.clone(),
            row.total_assets.to_string(),
            row.unowned_assets.to_string(),
        ]
    });
    format!(
        "BU / MBU\n{}",
        as_ascii_table(["BU", "MBU", "Total", "Unowned"], rows)
    )
}

/// Human-readable rendering of an ownership report. Failed aggregations show
/// as "no data available".
pub fn ownership_tables(report: &OwnershipReport) -> String {
    let summary = &report.summary;
    let mut sections = vec![if summary.error.is_some() {
        format!("Summary: {NO_DATA}")
    } else {
        as_ascii_table(
            ["Assets", "Unowned", "Parent clouds", "Clouds", "Teams"],
            [vec![
                summary.total_assets.to_string(),
                summary.total_assets_unowned.to_string(),
                summary.total_parent_clouds.to_string(),
                summary.total_clouds.to_string(),
                summary.total_teams.to_string(),
            ]],
        )
    }];
    sections.push(distribution_table("Parent cloud", &report.parent_cloud));
    sections.push(distribution_table("Cloud", &report.cloud));
    sections.push(distribution_table("Team", &report.team));
    sections.push(business_unit_table(&report.bu));
    sections.push(distribution_table("MBU", &report.mbu));
    sections.join("\n\n")
}
