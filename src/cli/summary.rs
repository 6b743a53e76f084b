//! `muninn summary` - aggregate products matching a search expression.

use clap::Args;

use crate::archive::Archive;
use crate::records::Value;

use super::open_archive;
use super::search::{normalize_order_by, CsvWriter, OutputFormat, PsvWriter, TableWriter};

const DEFAULT_STATS: &[&str] = &["size.sum", "validity_start.min", "validity_stop.max"];

#[derive(Args)]
pub struct SummaryCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression
    #[arg(value_name = "EXPRESSION", default_value = "")]
    pub expression: String,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "psv")]
    pub output_format: OutputFormat,

    /// Properties to group by; timestamps require a binning subscript such
    /// as `validity_start.yearmonth` (repeatable)
    #[arg(short, long = "group-by")]
    pub group_by: Vec<String>,

    /// Also group results by tag value; products with multiple tags are
    /// counted multiple times
    #[arg(short = 't', long)]
    pub group_by_tag: bool,

    /// Property aggregates as `<property>.<min|max|sum|avg>`; the synthetic
    /// `validity_duration` property may also be aggregated (repeatable)
    #[arg(short, long = "stats")]
    pub stats: Vec<String>,

    /// Expression used to filter on aggregates
    #[arg(long, value_name = "EXPRESSION")]
    pub stats_filter: Option<String>,

    /// Sort order specifiers over result columns (repeatable)
    #[arg(short, long = "order-by")]
    pub order_by: Vec<String>,
}

impl SummaryCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;

        let group_by = canonical_list(&archive, &self.group_by);
        let stats = if self.stats.is_empty() {
            canonical_list(
                &archive,
                &DEFAULT_STATS.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
        } else {
            canonical_list(&archive, &self.stats)
        };
        let order_by: Vec<String> = normalize_order_by(&self.order_by)
            .into_iter()
            .map(|item| {
                let (prefix, name) = item.split_at(1);
                format!("{}{}", prefix, canonical_property(&archive, name))
            })
            .collect();

        let (rows, header) = archive.summary(
            &self.expression,
            &Default::default(),
            &stats,
            &group_by,
            self.group_by_tag,
            self.stats_filter.as_deref(),
            &order_by,
        )?;

        let writer: Box<dyn TableWriter> = match self.output_format {
            OutputFormat::Psv => Box::new(PsvWriter),
            OutputFormat::Csv => Box::new(CsvWriter),
        };
        let header: Vec<String> = header
            .iter()
            .map(|name| name.strip_prefix("core.").unwrap_or(name).to_string())
            .collect();
        writer.header(&header);
        for row in &rows {
            let values: Vec<String> = row.iter().map(Value::to_string).collect();
            writer.row(&values);
        }

        archive.close()?;
        Ok(())
    }
}

fn canonical_list(archive: &Archive, items: &[String]) -> Vec<String> {
    items
        .iter()
        .flat_map(|item| item.split([' ', ',']))
        .filter(|item| !item.is_empty())
        .map(|item| canonical_property(archive, item))
        .collect()
}

/// Prefix bare core property names with their namespace, leaving `count`,
/// `tag`, and already-qualified names alone.
fn canonical_property(archive: &Archive, name: &str) -> String {
    if name == "count" || name == "tag" {
        return name.to_string();
    }

    let first = name.split('.').next().unwrap_or(name);
    let is_namespace = archive.namespace_schema(first).is_ok();
    let in_core = archive
        .namespace_schema("core")
        .map(|schema| schema.contains(first))
        .unwrap_or(false);

    if !is_namespace && (in_core || first == "validity_duration") {
        format!("core.{}", name)
    } else {
        name.to_string()
    }
}
