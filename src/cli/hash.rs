//! `muninn hash` - calculate or verify product hashes.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::error::Error;
use crate::hash::{product_hash, HashAlgorithm};

use super::open_archive;

#[derive(Args)]
pub struct HashCommand {
    #[command(subcommand)]
    pub command: HashSubcommand,
}

#[derive(Subcommand)]
pub enum HashSubcommand {
    /// Calculate the hash of local product files
    Calc {
        /// Product files or directories (hashed as one product)
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Digest algorithm
        #[arg(short = 't', long, default_value = "md5")]
        hash_type: String,
    },

    /// Verify the stored hash of archived products
    Verify {
        /// Identifier of the archive to use
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Search expression selecting the products to verify
        #[arg(value_name = "EXPRESSION")]
        expression: String,
    },
}

impl HashCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        match self.command {
            HashSubcommand::Calc { paths, hash_type } => {
                let algorithm = HashAlgorithm::from_name(&hash_type).ok_or_else(|| {
                    Error::User(format!("unknown hash algorithm \"{}\"", hash_type))
                })?;
                println!("{}", product_hash(&paths, algorithm)?);
                Ok(())
            }
            HashSubcommand::Verify {
                archive,
                expression,
            } => {
                let archive = open_archive(&archive)?;
                let failed =
                    archive.verify_hash(expression.as_str(), &Default::default())?;
                for uuid in &failed {
                    println!("{}", uuid);
                }
                archive.close()?;
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(Error::HashMismatch(format!(
                        "{} product(s) failed hash verification",
                        failed.len()
                    ))
                    .into())
                }
            }
        }
    }
}
