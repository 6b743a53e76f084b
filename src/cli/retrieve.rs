//! `muninn retrieve` and `muninn export` - copy products out of an archive.

use std::path::PathBuf;

use clap::Args;

use super::open_archive;

#[derive(Args)]
pub struct RetrieveCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to retrieve
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,

    /// Directory in which retrieved products will be stored
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Retrieve symbolic links to the products instead of copies
    #[arg(short, long)]
    pub link: bool,
}

impl RetrieveCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        let paths = archive.retrieve(
            self.expression.as_str(),
            &Default::default(),
            &self.directory,
            self.link,
        )?;
        for path in paths {
            println!("{}", path.display());
        }
        archive.close()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct ExportCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to export
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,

    /// Directory in which exported products will be stored
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Export format; by default a copy of the original product is made
    #[arg(short, long)]
    pub format: Option<String>,
}

impl ExportCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        let paths = archive.export(
            self.expression.as_str(),
            &Default::default(),
            &self.directory,
            self.format.as_deref(),
        )?;
        for path in paths {
            println!("{}", path.display());
        }
        archive.close()?;
        Ok(())
    }
}
