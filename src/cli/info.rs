//! `muninn info` - display general information about an archive.

use clap::Args;

use super::open_archive;

#[derive(Args)]
pub struct InfoCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,
}

impl InfoCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;

        if let Some(id) = archive.id() {
            println!("archive: {}", id);
        }
        if let Some(root) = archive.root() {
            println!("root: {}", root.display());
        }
        println!("namespaces: {}", archive.namespaces().join(", "));
        println!("product types: {}", archive.product_types().join(", "));
        println!("remote backends: {}", archive.remote_backends().join(", "));
        println!("export formats: {}", archive.export_formats().join(", "));
        println!("products: {}", archive.count("", &Default::default())?);

        archive.close()?;
        Ok(())
    }
}
