//! `muninn ingest` - ingest products into an archive.

use std::path::PathBuf;

use clap::Args;

use crate::archive::{IngestOptions, Selection};

use super::open_archive;

#[derive(Args)]
pub struct IngestCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Products to ingest; multiple paths form one logical product
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Force the product type of the products to ingest
    #[arg(short = 't', long)]
    pub product_type: Option<String>,

    /// Tag to set on the product (repeatable)
    #[arg(short = 'T', long = "tag")]
    pub tags: Vec<String>,

    /// Ingest symbolic links to the product instead of copies
    #[arg(short, long, conflicts_with_all = ["catalogue_only", "keep"])]
    pub link: bool,

    /// Only ingest product properties
    #[arg(short, long)]
    pub catalogue_only: bool,

    /// Keep the product at its current path, which must be inside the
    /// archive root
    #[arg(short, long)]
    pub keep: bool,

    /// Remove any existing product with the same type and name before
    /// ingesting
    #[arg(short, long)]
    pub force: bool,

    /// Verify the hash of the product after it has been put in the archive
    #[arg(long)]
    pub verify_hash: bool,
}

impl IngestCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;

        let properties = archive.ingest(
            &self.paths,
            IngestOptions {
                product_type: self.product_type,
                properties: None,
                catalogue_only: self.catalogue_only,
                use_symlinks: if self.link { Some(true) } else { None },
                verify_hash: self.verify_hash,
                use_current_path: self.keep,
                force: self.force,
            },
        )?;

        if !self.tags.is_empty() {
            archive.tag(
                Selection::Uuid(properties.uuid()?),
                &self.tags,
                &Default::default(),
            )?;
        }

        println!("{}", properties.uuid()?);
        archive.close()?;
        Ok(())
    }
}
