//! `muninn search` - search an archive for products.

use clap::{Args, ValueEnum};

use crate::archive::Archive;
use crate::records::Properties;

use super::open_archive;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pipe separated values
    Psv,
    /// Comma separated values
    Csv,
}

#[derive(Args)]
pub struct SearchCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression
    #[arg(value_name = "EXPRESSION", default_value = "")]
    pub expression: String,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "psv")]
    pub output_format: OutputFormat,

    /// Limit the maximum number of products
    #[arg(short, long)]
    pub limit: Option<u64>,

    /// Sort order specifiers; a "+" prefix denotes ascending order, no
    /// prefix denotes descending order (repeatable)
    #[arg(short, long = "order-by")]
    pub order_by: Vec<String>,

    /// Properties to output; `<namespace>.*` includes all properties of a
    /// namespace, `*` includes all namespaces (repeatable)
    #[arg(short, long = "property")]
    pub properties: Vec<String>,

    /// Print only the number of products matching the search expression
    #[arg(short, long, conflicts_with_all = ["uuid", "paths"])]
    pub count: bool,

    /// Print only the uuid of each matching product
    #[arg(short, long, conflicts_with = "paths")]
    pub uuid: bool,

    /// Print only the path of each matching product
    #[arg(long)]
    pub paths: bool,
}

impl SearchCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;

        if self.count {
            println!("{}", archive.count(&self.expression, &Default::default())?);
            archive.close()?;
            return Ok(());
        }

        let order_by = normalize_order_by(&self.order_by);

        if self.uuid {
            let products = archive.search(
                &self.expression,
                &order_by,
                self.limit,
                &Default::default(),
                &[],
                &["uuid".to_string()],
            )?;
            for product in &products {
                println!("{}", product.uuid()?);
            }
            archive.close()?;
            return Ok(());
        }

        if self.paths {
            let mut order_by = order_by;
            order_by.push("+core.archive_path".to_string());
            order_by.push("+core.physical_name".to_string());
            let products = archive.search(
                &self.expression,
                &order_by,
                self.limit,
                &Default::default(),
                &[],
                &["archive_path".to_string(), "physical_name".to_string()],
            )?;
            for product in &products {
                if let Some(path) = archive.product_path(product)? {
                    println!("{}", path);
                }
            }
            archive.close()?;
            return Ok(());
        }

        let properties = resolve_properties(&archive, &self.properties)?;
        let property_names: Vec<String> = properties
            .iter()
            .map(|(namespace, name)| format!("{}.{}", namespace, name))
            .collect();

        let products = archive.search(
            &self.expression,
            &order_by,
            self.limit,
            &Default::default(),
            &[],
            &property_names,
        )?;

        let writer: Box<dyn TableWriter> = match self.output_format {
            OutputFormat::Psv => Box::new(PsvWriter),
            OutputFormat::Csv => Box::new(CsvWriter),
        };
        writer.header(&property_names);
        for product in &products {
            writer.row(&row_values(&properties, product));
        }

        archive.close()?;
        Ok(())
    }
}

/// Order specifiers without an explicit prefix sort descending; a "-" prefix
/// would be taken for an option on the command line.
pub(super) fn normalize_order_by(items: &[String]) -> Vec<String> {
    items
        .iter()
        .flat_map(|item| item.split([' ', ',']))
        .filter(|item| !item.is_empty())
        .map(|item| {
            if item.starts_with('+') || item.starts_with('-') {
                item.to_string()
            } else {
                format!("-{}", item)
            }
        })
        .collect()
}

fn resolve_properties(
    archive: &Archive,
    requested: &[String],
) -> crate::error::Result<Vec<(String, String)>> {
    if requested.is_empty() {
        let core = archive.namespace_schema("core")?;
        return Ok(core
            .field_names()
            .into_iter()
            .map(|name| ("core".to_string(), name))
            .collect());
    }

    let mut properties = Vec::new();
    for item in requested
        .iter()
        .flat_map(|item| item.split([' ', ',']))
        .filter(|item| !item.is_empty())
    {
        let (namespace, name) = match item.split_once('.') {
            None if item == "*" => ("*", "*"),
            None => ("core", item),
            Some((namespace, name)) => (namespace, name),
        };

        let namespaces = if namespace == "*" {
            let mut all = archive.namespaces();
            all.retain(|candidate| candidate != "core");
            all.insert(0, "core".to_string());
            all
        } else {
            vec![namespace.to_string()]
        };

        for namespace in namespaces {
            let schema = archive.namespace_schema(&namespace)?;
            if name == "*" {
                properties.extend(
                    schema
                        .field_names()
                        .into_iter()
                        .map(|name| (namespace.clone(), name)),
                );
            } else {
                if !schema.contains(name) {
                    return Err(crate::error::Error::User(format!(
                        "no property: \"{}\" defined within namespace: \"{}\"",
                        name, namespace
                    )));
                }
                properties.push((namespace.clone(), name.to_string()));
            }
        }
    }
    Ok(properties)
}

fn row_values(properties: &[(String, String)], product: &Properties) -> Vec<String> {
    properties
        .iter()
        .map(|(namespace, name)| {
            product
                .namespace(namespace)
                .and_then(|record| record.get(name))
                .map(|value| value.to_string())
                .unwrap_or_default()
        })
        .collect()
}

pub(super) trait TableWriter {
    fn header(&self, names: &[String]);
    fn row(&self, values: &[String]);
}

pub(super) struct PsvWriter;

impl TableWriter for PsvWriter {
    fn header(&self, names: &[String]) {
        println!("| {} |", names.join(" | "));
    }

    fn row(&self, values: &[String]) {
        println!("| {} |", values.join(" | "));
    }
}

pub(super) struct CsvWriter;

impl TableWriter for CsvWriter {
    fn header(&self, names: &[String]) {
        let quoted: Vec<String> = names
            .iter()
            .map(|name| format!("\"{}\"", name.replace('"', "\"\"")))
            .collect();
        println!("{}", quoted.join(","));
    }

    fn row(&self, values: &[String]) {
        let quoted: Vec<String> = values
            .iter()
            .map(|value| format!("\"{}\"", value.replace('"', "\"\"")))
            .collect();
        println!("{}", quoted.join(","));
    }
}
