//! Command-line interface.
//!
//! One subcommand per archive operation, mirroring the engine API. The
//! binary ships without extensions registered; archives whose configuration
//! lists extensions must be driven through an embedding application.

mod admin;
mod attach;
mod hash;
mod info;
mod ingest;
mod pull;
mod retrieve;
mod search;
mod summary;
mod tag;
mod update;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::archive::Archive;
use crate::extension::Registry;

/// Muninn - data product archive
#[derive(Parser)]
#[command(name = "muninn")]
#[command(about = "Archive, query, and manage data products")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Process products in parallel
    #[arg(long, global = true)]
    pub parallel: bool,

    /// Number of worker processes to use with --parallel
    #[arg(long, global = true, value_name = "N")]
    pub processes: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Attach product data to an existing catalogue record
    Attach(attach::AttachCommand),

    /// Completely remove an archive
    Destroy(admin::DestroyCommand),

    /// Export products from an archive
    Export(retrieve::ExportCommand),

    /// Calculate or verify product hashes
    Hash(hash::HashCommand),

    /// Display general information about an archive
    Info(info::InfoCommand),

    /// Ingest products into an archive
    Ingest(ingest::IngestCommand),

    /// List the tags of products
    #[command(name = "list-tags")]
    ListTags(tag::ListTagsCommand),

    /// Prepare an archive for first use
    Prepare(admin::PrepareCommand),

    /// Pull remote products into an archive
    Pull(pull::PullCommand),

    /// Remove products from an archive
    Remove(admin::RemoveCommand),

    /// Retrieve products from an archive
    Retrieve(retrieve::RetrieveCommand),

    /// Search an archive for products
    Search(search::SearchCommand),

    /// Remove product data from storage, keeping the catalogue records
    Strip(admin::StripCommand),

    /// Summarize products matching a search expression
    Summary(summary::SummaryCommand),

    /// Set tags on products
    Tag(tag::TagCommand),

    /// Remove tags from products
    Untag(tag::UntagCommand),

    /// Refresh product properties or pulled data
    Update(update::UpdateCommand),
}

impl App {
    /// Run the CLI application.
    pub fn run(self) -> color_eyre::Result<()> {
        if self.parallel || self.processes.is_some() {
            warn!("parallel execution is not supported by this tool; processing sequentially");
        }

        match self.command {
            Command::Attach(command) => command.run(),
            Command::Destroy(command) => command.run(),
            Command::Export(command) => command.run(),
            Command::Hash(command) => command.run(),
            Command::Info(command) => command.run(),
            Command::Ingest(command) => command.run(),
            Command::ListTags(command) => command.run(),
            Command::Prepare(command) => command.run(),
            Command::Pull(command) => command.run(),
            Command::Remove(command) => command.run(),
            Command::Retrieve(command) => command.run(),
            Command::Search(command) => command.run(),
            Command::Strip(command) => command.run(),
            Command::Summary(command) => command.run(),
            Command::Tag(command) => command.run(),
            Command::Untag(command) => command.run(),
            Command::Update(command) => command.run(),
        }
    }
}

pub(crate) fn open_archive(id: &str) -> crate::error::Result<Archive> {
    crate::open(id, &Registry::new())
}
