//! `muninn attach` - attach product data to an existing catalogue record.

use std::path::PathBuf;

use clap::Args;

use crate::archive::AttachOptions;

use super::open_archive;

#[derive(Args)]
pub struct AttachCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Product files to attach
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Force the product type of the products to attach
    #[arg(short = 't', long)]
    pub product_type: Option<String>,

    /// Store symbolic links instead of copies
    #[arg(short, long, conflicts_with = "keep")]
    pub link: bool,

    /// Keep the product at its current path inside the archive root
    #[arg(short, long)]
    pub keep: bool,

    /// Skip the size check against the catalogued metadata
    #[arg(short, long)]
    pub force: bool,

    /// Verify the hash of the product after it has been attached
    #[arg(long)]
    pub verify_hash: bool,

    /// Verify the product against the catalogued hash before attaching
    #[arg(long)]
    pub verify_hash_before: bool,
}

impl AttachCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;

        let product = archive.attach(
            &self.paths,
            AttachOptions {
                product_type: self.product_type,
                use_symlinks: if self.link { Some(true) } else { None },
                verify_hash: self.verify_hash,
                verify_hash_before: self.verify_hash_before,
                use_current_path: self.keep,
                force: self.force,
            },
        )?;

        println!("{}", product.uuid()?);
        archive.close()?;
        Ok(())
    }
}
