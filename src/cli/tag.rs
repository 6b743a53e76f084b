//! `muninn tag`, `muninn untag`, and `muninn list-tags`.

use clap::Args;

use super::open_archive;

#[derive(Args)]
pub struct TagCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to tag
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,

    /// Tags to set
    #[arg(value_name = "TAG", required = true)]
    pub tags: Vec<String>,
}

impl TagCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        archive.tag(self.expression.as_str(), &self.tags, &Default::default())?;
        archive.close()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct UntagCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to untag
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,

    /// Tags to remove; all tags are removed when none are given
    #[arg(value_name = "TAG")]
    pub tags: Vec<String>,
}

impl UntagCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        let tags = if self.tags.is_empty() {
            None
        } else {
            Some(self.tags.as_slice())
        };
        archive.untag(self.expression.as_str(), tags, &Default::default())?;
        archive.close()?;
        Ok(())
    }
}

#[derive(Args)]
pub struct ListTagsCommand {
    /// Identifier of the archive to use
    #[arg(value_name = "ARCHIVE")]
    pub archive: String,

    /// Search expression selecting the products to list tags for
    #[arg(value_name = "EXPRESSION")]
    pub expression: String,
}

impl ListTagsCommand {
    pub fn run(self) -> color_eyre::Result<()> {
        let archive = open_archive(&self.archive)?;
        let products = archive.search(
            &self.expression,
            &[],
            None,
            &Default::default(),
            &[],
            &["uuid".to_string()],
        )?;
        for product in &products {
            let uuid = product.uuid()?;
            let tags = archive.tags(uuid)?;
            println!("{}: {}", uuid, tags.join(", "));
        }
        archive.close()?;
        Ok(())
    }
}
