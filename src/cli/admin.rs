//! `muninn prepare`, `muninn destroy`, `muninn remove`, and `muninn strip`.

use clap::Args;

use super::open_archive;

#[derive(Args)]
pub struct PrepareCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Remove any existing products and catalogue first
    #[arg(short, long)]
    pub force: bool,

    /// Print the catalogue DDL statements without executing them
    #[arg(long)]
    pub dry_run: bool,
}

impl PrepareCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        if self.dry_run {
            for statement in archive.prepare_catalogue(true)? {
                println!("{};", statement);
            }
        } else {
            archive.prepare(self.force)?;
        }
        archive.close()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct DestroyCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Only remove the catalogue, leaving the data store untouched
    #[arg(long)]
    pub catalogue_only: bool,
}

impl DestroyCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        if self.catalogue_only {
            archive.destroy_catalogue()?;
        } else {
            archive.destroy()?;
        }
        archive.close()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct RemoveCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to remove
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,

    /// Also remove partially ingested products
    #[arg(short, long)]
    pub force: bool,

    /// Do not apply cascade rules to dependent products
    #[arg(long)]
    pub no_cascade: bool,
}

impl RemoveCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        let count = archive.remove(
            self.expression.as_str(),
            &Default::default(),
            self.force,
            !self.no_cascade,
        )?;
        println!("removed {} product(s)", count);
        archive.close()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct StripCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to strip
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,

    /// Also strip partially ingested products
    #[arg(short, long)]
    pub force: bool,

    /// Do not apply cascade rules to dependent products
    #[arg(long)]
    pub no_cascade: bool,
}

impl StripCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        let count = archive.strip(
            self.expression.as_str(),
            &Default::default(),
            self.force,
            !self.no_cascade,
        )?;
        println!("stripped {} product(s)", count);
        archive.close()?;
        Ok(())
    }
}
