//! Muninn - a data product archive.
//!
//! A catalogue-plus-store that treats every archived artifact as a product
//! with typed metadata, a byte stream in pluggable storage, and a
//! lineage/tag graph linking products to their sources.
//!
//! Typical use:
//!
//! ```no_run
//! use muninn::extension::Registry;
//!
//! let archive = muninn::open("my-archive", &Registry::new()).unwrap();
//! let products = archive
//!     .search("product_name == \"pi.txt\"", &[], None, &Default::default(), &[], &[])
//!     .unwrap();
//! ```

pub mod archive;
pub mod catalogue;
pub mod cli;
pub mod config;
pub mod error;
pub mod extension;
pub mod geometry;
pub mod hash;
pub mod language;
pub mod records;
pub mod remote;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod util;

pub use archive::{Archive, AttachOptions, IngestOptions, Selection};
pub use config::{config_path, list_archives, Config};
pub use error::{Error, Result};
pub use records::{Properties, Record, Value};

/// Open an archive by id, locating `<id>.toml` along the
/// `MUNINN_CONFIG_PATH` search path. The id may also be a direct path to a
/// configuration file (ending in `.toml`).
pub fn open(id: &str, registry: &extension::Registry) -> Result<Archive> {
    let config_file = config::locate_config_file(id)?;
    let configuration = Config::load(&config_file)?;

    let id = id
        .rsplit('/')
        .next()
        .unwrap_or(id)
        .trim_end_matches(".toml")
        .to_string();

    Archive::create(&configuration, Some(id), registry)
}
