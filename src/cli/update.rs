//! `muninn update` - refresh product properties or pulled data.

use clap::{Args, Subcommand};

use crate::records::Properties;

use super::open_archive;

#[derive(Args)]
pub struct UpdateCommand {
    #[command(subcommand)]
    pub command: UpdateSubcommand,
}

#[derive(Subcommand)]
pub enum UpdateSubcommand {
    /// Re-extract product properties from the archived data
    Ingest {
        /// Identifier of the archive to use
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Search expression selecting the products to update
        #[arg(value_name = "EXPRESSION", default_value = "")]
        expression: String,

        /// Do not run product type hooks
        #[arg(long)]
        disable_hooks: bool,

        /// Do not relocate products to their plugin-derived archive path
        #[arg(short, long)]
        keep: bool,
    },

    /// Re-verify pulled products and re-run their post pull hooks
    Pull {
        /// Identifier of the archive to use
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Search expression selecting the products to update
        #[arg(value_name = "EXPRESSION", default_value = "")]
        expression: String,

        /// Verify each product against its catalogued hash
        #[arg(long)]
        verify_hash: bool,

        /// Do not run product type hooks
        #[arg(long)]
        disable_hooks: bool,

        /// Do not relocate products to their plugin-derived archive path
        #[arg(short, long)]
        keep: bool,
    },

    /// Change the product type of the selected products
    Retype {
        /// Identifier of the archive to use
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Search expression selecting the products to retype
        #[arg(value_name = "EXPRESSION")]
        expression: String,

        /// New product type (must be a registered product type)
        #[arg(value_name = "PRODUCT_TYPE")]
        product_type: String,
    },
}

impl UpdateCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        match self.command {
            UpdateSubcommand::Ingest {
                archive,
                expression,
                disable_hooks,
                keep,
            } => {
                let archive = open_archive(&archive)?;
                let products = archive.search(
                    &expression,
                    &[],
                    None,
                    &Default::default(),
                    &[],
                    &["uuid".to_string()],
                )?;
                for product in &products {
                    archive.rebuild_properties(product.uuid()?, disable_hooks, keep)?;
                }
                archive.close()?;
                Ok(())
            }
            UpdateSubcommand::Pull {
                archive,
                expression,
                verify_hash,
                disable_hooks,
                keep,
            } => {
                let archive = open_archive(&archive)?;
                let products = archive.search(
                    &expression,
                    &[],
                    None,
                    &Default::default(),
                    &[],
                    &["uuid".to_string()],
                )?;
                for product in &products {
                    archive.rebuild_pull_properties(
                        product.uuid()?,
                        verify_hash,
                        disable_hooks,
                        keep,
                    )?;
                }
                archive.close()?;
                Ok(())
            }
            UpdateSubcommand::Retype {
                archive,
                expression,
                product_type,
            } => {
                let archive = open_archive(&archive)?;
                // the new type must be served by a registered plugin
                archive.product_type_plugin(&product_type)?;

                let products = archive.search(
                    &expression,
                    &[],
                    None,
                    &Default::default(),
                    &[],
                    &["uuid".to_string()],
                )?;
                for product in &products {
                    let mut update = Properties::with_core();
                    update
                        .core_mut()
                        .set("product_type", product_type.as_str());
                    archive.update_properties(&update, Some(product.uuid()?), false)?;
                }
                println!("retyped {} product(s)", products.len());
                archive.close()?;
                Ok(())
            }
        }
    }
}
