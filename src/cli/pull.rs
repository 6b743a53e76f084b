//! `muninn pull` - pull remote products into an archive.

use clap::Args;

use super::open_archive;

#[derive(Args)]
pub struct PullCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to pull
    #[arg(value_name = "EXPRESSION", default_value = "")]
    pub expression: String,

    /// Verify the hash of each product after it is stored
    #[arg(long)]
    pub verify_hash: bool,

    /// Verify each download against the catalogued hash before storing
    #[arg(long)]
    pub verify_hash_download: bool,
}

impl PullCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;

        // only remote products that are not yet in the local archive
        let mut expression =
            "active and is_defined(remote_url) and not is_defined(archive_path)".to_string();
        if !self.expression.is_empty() {
            expression = format!("{} and ({})", expression, self.expression);
        }

        let count = archive.pull(
            expression.as_str(),
            &Default::default(),
            self.verify_hash,
            self.verify_hash_download,
        )?;
        println!("pulled {} product(s)", count);
        archive.close()?;
        Ok(())
    }
}
