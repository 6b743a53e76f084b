//! Product hashing.
//!
//! A product digest is stored as `"<algo>:<hex>"`. Directory trees are
//! fingerprinted by folding entry names, entry kinds, and entry digests into
//! the parent digest, so the result is stable under file-order permutation
//! and, when links are resolved, under symlink redirection.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use digest::DynDigest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

const BLOCK_SIZE: usize = 65536;

/// Digest algorithms supported for the `core.hash` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "md5" => Some(HashAlgorithm::Md5),
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha224" => Some(HashAlgorithm::Sha224),
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha384" => Some(HashAlgorithm::Sha384),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            HashAlgorithm::Md5 => Box::new(Md5::default()),
            HashAlgorithm::Sha1 => Box::new(Sha1::default()),
            HashAlgorithm::Sha224 => Box::new(Sha224::default()),
            HashAlgorithm::Sha256 => Box::new(Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(Sha512::default()),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Extract the algorithm from a stored `"<algo>:<hex>"` digest. Returns None
/// for legacy values without a recognized prefix (implied sha1).
pub fn extract_hash_type(value: &str) -> Option<HashAlgorithm> {
    let (prefix, _) = value.split_once(':')?;
    HashAlgorithm::from_name(prefix)
}

fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut hasher = algorithm.hasher();
    let mut stream = File::open(path)?;
    let mut block = [0u8; BLOCK_SIZE];
    loop {
        let count = stream.read(&mut block)?;
        if count == 0 {
            return Ok(hex::encode(hasher.finalize()));
        }
        hasher.update(&block[..count]);
    }
}

fn entry_kind(path: &Path, resolve_links: bool) -> &'static [u8] {
    if path.is_symlink() && !resolve_links {
        b"l"
    } else if path.is_dir() {
        b"d"
    } else {
        b"f"
    }
}

fn product_hash_rec(
    root: &Path,
    resolve_root: bool,
    resolve_links: bool,
    algorithm: HashAlgorithm,
) -> Result<String> {
    if root.is_symlink() && !(resolve_root || resolve_links) {
        // Hash the link contents, not the link target.
        let target = std::fs::read_link(root)?;
        Ok(hash_bytes(
            target.to_string_lossy().as_bytes(),
            algorithm,
        ))
    } else if root.is_file() {
        hash_file(root, algorithm)
    } else if root.is_dir() {
        let mut basenames: Vec<String> = std::fs::read_dir(root)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_>>()?;
        basenames.sort();

        let mut hasher = algorithm.hasher();
        for basename in basenames {
            hasher.update(hash_bytes(basename.as_bytes(), algorithm).as_bytes());

            let path = root.join(&basename);
            hasher.update(entry_kind(&path, resolve_root || resolve_links));
            hasher.update(product_hash_rec(&path, false, resolve_links, algorithm)?.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    } else {
        Err(Error::User(format!(
            "path does not refer to a regular file or directory: {}",
            root.display()
        )))
    }
}

/// Compute the digest of a product made up of one or more root paths.
///
/// A single root is hashed bare; multiple roots are folded into one digest in
/// sorted order, including their basenames and entry kinds.
pub fn product_hash(roots: &[PathBuf], algorithm: HashAlgorithm) -> Result<String> {
    product_hash_with(roots, algorithm, true, false, false)
}

pub fn product_hash_with(
    roots: &[PathBuf],
    algorithm: HashAlgorithm,
    resolve_root: bool,
    resolve_links: bool,
    force_encapsulation: bool,
) -> Result<String> {
    if roots.len() == 1 && !force_encapsulation {
        let digest = product_hash_rec(&roots[0], resolve_root, resolve_links, algorithm)?;
        return Ok(format!("{}:{}", algorithm, digest));
    }

    let mut sorted: Vec<&PathBuf> = roots.iter().collect();
    sorted.sort();

    let mut hasher = algorithm.hasher();
    for root in sorted {
        let basename = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        hasher.update(hash_bytes(basename.as_bytes(), algorithm).as_bytes());
        hasher.update(entry_kind(root, resolve_root || resolve_links));
        hasher.update(product_hash_rec(root, resolve_root, resolve_links, algorithm)?.as_bytes());
    }
    Ok(format!("{}:{}", algorithm, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_carries_algorithm_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"31415").unwrap();

        let digest = product_hash(&[path], HashAlgorithm::Sha1).unwrap();
        assert!(digest.starts_with("sha1:"));
        assert!(digest[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn multi_root_hash_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("1.txt");
        let two = dir.path().join("2.txt");
        fs::write(&one, b"one").unwrap();
        fs::write(&two, b"two").unwrap();

        let forward = product_hash(&[one.clone(), two.clone()], HashAlgorithm::Md5).unwrap();
        let reverse = product_hash(&[two, one], HashAlgorithm::Md5).unwrap();
        assert_eq!(forward, reverse);
    }

    #[cfg(unix)]
    #[test]
    fn resolved_link_hashes_like_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.txt");
        fs::write(&target, b"payload").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let direct =
            product_hash_with(&[target], HashAlgorithm::Sha256, true, true, false).unwrap();
        let via_link =
            product_hash_with(&[link], HashAlgorithm::Sha256, true, true, false).unwrap();
        assert_eq!(direct, via_link);
    }

    #[test]
    fn directory_fingerprint_reflects_entry_names() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("product");
        fs::create_dir(&tree).unwrap();
        fs::write(tree.join("a.txt"), b"data").unwrap();

        let before = product_hash(&[tree.clone()], HashAlgorithm::Sha1).unwrap();
        fs::rename(tree.join("a.txt"), tree.join("b.txt")).unwrap();
        let after = product_hash(&[tree], HashAlgorithm::Sha1).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn extracts_known_prefixes_only() {
        assert_eq!(
            extract_hash_type("sha256:abcd"),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(extract_hash_type("0123abcd"), None);
        assert_eq!(extract_hash_type("whirlpool:abcd"), None);
    }
}
