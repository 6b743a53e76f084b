//! Remote product transfer.
//!
//! One backend per URL scheme, selected by longest-prefix match of the
//! product's `remote_url`. Built-ins cover `file://`, `http://` and
//! `https://`; other schemes come in through the remote backend plugin API.
//! Downloads of known archive formats are extracted in place.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::hash::{extract_hash_type, product_hash, HashAlgorithm};
use crate::records::Properties;
use crate::util;

/// Remote transfer backend plugin interface.
pub trait RemoteBackend {
    /// Whether this backend can pull the given URL.
    fn identify(&self, url: &str) -> bool;

    /// URL prefix served by this backend; used for longest-prefix selection
    /// among all backends that identify a URL.
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Download the product into `target_dir` and return the local paths.
    fn pull(&self, archive: &Archive, product: &Properties, target_dir: &Path)
        -> Result<Vec<PathBuf>>;
}

/// One credential record of the auth file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    OAuth2 {
        auth_type: String,
        client_id: String,
        client_secret: String,
        token_url: String,
        username: String,
        password: String,
        grant_type: String,
    },
    S3 {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        region: Option<String>,
        access_key: String,
        secret_access_key: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

/// Resolve credentials for a URL by scanning the auth file: first by URL
/// prefix, then by hostname (except for s3, whose hostname is a bucket).
pub fn get_credentials(auth_file: Option<&Path>, url: &str) -> Result<Option<Credentials>> {
    let auth_file = match auth_file {
        Some(path) => path,
        None => return Ok(None),
    };

    let contents = std::fs::read_to_string(auth_file)?;
    let credentials: std::collections::BTreeMap<String, Credentials> =
        serde_json::from_str(&contents)
            .map_err(|error| Error::User(format!("invalid auth file: {}", error)))?;

    for (key, record) in &credentials {
        if url.starts_with(key.as_str()) {
            return Ok(Some(record.clone()));
        }
    }

    if let Ok(parsed) = Url::parse(url) {
        if parsed.scheme() != "s3" {
            if let Some(host) = parsed.host_str() {
                if let Some(record) = credentials.get(host) {
                    return Ok(Some(record.clone()));
                }
            }
        }
    }

    Ok(None)
}

/// Extract a downloaded file when it is a recognized archive of the product
/// (`<physical_name>.zip`, `.tar`, `.tgz`, `.tar.gz`). Returns the
/// resulting top-level paths; an unrecognized file is returned as-is.
pub fn auto_extract(file_path: &Path, product: &Properties) -> Result<Vec<PathBuf>> {
    let dirname = file_path
        .parent()
        .ok_or_else(|| Error::Internal("downloaded file without parent".to_string()))?
        .to_path_buf();
    let filename = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let physical_name = product.physical_name()?;

    for extension in [".zip", ".ZIP"] {
        if filename == format!("{}{}", physical_name, extension) {
            let paths = extract_zip(file_path, &dirname)?;
            util::remove_path(file_path)?;
            return Ok(paths);
        }
    }

    for extension in [".tar", ".TAR"] {
        if filename == format!("{}{}", physical_name, extension) {
            let reader = File::open(file_path)?;
            let paths = extract_tar(tar::Archive::new(reader), &dirname)?;
            util::remove_path(file_path)?;
            return Ok(paths);
        }
    }

    for extension in [".tgz", ".tar.gz", ".TGZ", ".TAR.GZ"] {
        if filename == format!("{}{}", physical_name, extension) {
            let reader = flate2::read::GzDecoder::new(File::open(file_path)?);
            let paths = extract_tar(tar::Archive::new(reader), &dirname)?;
            util::remove_path(file_path)?;
            return Ok(paths);
        }
    }

    for extension in [".txz", ".tar.xz", ".tbz", ".tb2", ".tar.bz2"] {
        if filename == format!("{}{}", physical_name, extension) {
            return Err(Error::Download(format!(
                "cannot extract \"{}\": xz/bzip2 archives are not supported",
                filename
            )));
        }
    }

    Ok(vec![file_path.to_path_buf()])
}

fn extract_zip(file_path: &Path, dirname: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(file_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| Error::Download(format!("invalid zip archive: {}", error)))?;

    let mut top_level: Vec<String> = archive
        .file_names()
        .map(|name| name.split('/').next().unwrap_or(name).to_string())
        .collect();
    top_level.sort();
    top_level.dedup();

    archive
        .extract(dirname)
        .map_err(|error| Error::Download(format!("cannot extract zip archive: {}", error)))?;

    Ok(top_level
        .into_iter()
        .map(|name| dirname.join(name))
        .collect())
}

fn extract_tar<R: std::io::Read>(
    mut archive: tar::Archive<R>,
    dirname: &Path,
) -> Result<Vec<PathBuf>> {
    let mut top_level: Vec<String> = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let member_path = entry.path()?.into_owned();
        // unpack_in refuses members whose resolved path escapes the target
        if entry.unpack_in(dirname)? {
            if let Some(first) = member_path.components().next() {
                top_level.push(first.as_os_str().to_string_lossy().into_owned());
            }
        }
    }
    top_level.sort();
    top_level.dedup();
    Ok(top_level
        .into_iter()
        .map(|name| dirname.join(name))
        .collect())
}

fn filename_from_response(response: &reqwest::blocking::Response) -> Option<String> {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let start = header.find("filename=")? + "filename=".len();
    let value = header[start..].trim();
    let value = value.split(';').next()?.trim().trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn download_response(
    mut response: reqwest::blocking::Response,
    target_dir: &Path,
) -> Result<PathBuf> {
    let basename = filename_from_response(&response).unwrap_or_else(|| {
        Path::new(response.url().path())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string())
    });
    let local_file = target_dir.join(basename);
    let mut output = File::create(&local_file)?;
    response
        .copy_to(&mut output)
        .map_err(|error| Error::Download(format!("error writing download: {}", error)))?;
    output.flush()?;
    Ok(local_file)
}

/// Built-in backend for `file://` URLs.
pub struct FileBackend;

impl RemoteBackend for FileBackend {
    fn identify(&self, url: &str) -> bool {
        url.starts_with("file://")
    }

    fn prefix(&self) -> Option<&str> {
        Some("file://")
    }

    fn pull(
        &self,
        _archive: &Archive,
        product: &Properties,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let url = product
            .remote_url()
            .ok_or_else(|| Error::Download("product has no remote_url".to_string()))?;
        let source_path = PathBuf::from(url.trim_start_matches("file://"));
        let basename = source_path.file_name().ok_or_else(|| {
            Error::Download(format!("cannot derive a file name from \"{}\"", url))
        })?;
        let target_path = target_dir.join(basename);
        util::copy_path(&source_path, &target_path, true, false)?;
        auto_extract(&target_path, product)
    }
}

/// Built-in backend for `http://` and `https://` URLs, with optional basic
/// authentication or an OAuth2 resource-owner password grant.
pub struct HttpBackend {
    prefix: &'static str,
    timeout: u64,
    retries: u32,
}

impl HttpBackend {
    pub fn new(prefix: &'static str, timeout: u64, retries: u32) -> Self {
        HttpBackend {
            prefix,
            timeout,
            retries,
        }
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.timeout))
            .build()
            .map_err(|error| Error::Download(format!("cannot set up http client: {}", error)))
    }

    fn fetch_oauth2_token(
        &self,
        client: &reqwest::blocking::Client,
        credentials: &Credentials,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let (token_url, form) = match credentials {
            Credentials::OAuth2 {
                client_id,
                client_secret,
                token_url,
                username,
                password,
                ..
            } => (
                token_url.clone(),
                vec![
                    ("grant_type".to_string(), "password".to_string()),
                    ("username".to_string(), username.clone()),
                    ("password".to_string(), password.clone()),
                    ("client_id".to_string(), client_id.clone()),
                    ("client_secret".to_string(), client_secret.clone()),
                ],
            ),
            _ => {
                return Err(Error::Download(
                    "oauth2 download requires oauth2 credentials".to_string(),
                ))
            }
        };

        let response = client
            .post(&token_url)
            .form(&form)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|error| {
                Error::Download(format!("cannot obtain oauth2 token: {}", error))
            })?;
        let token: TokenResponse = response.json().map_err(|error| {
            Error::Download(format!("invalid oauth2 token response: {}", error))
        })?;
        Ok(token.access_token)
    }

    fn download(
        &self,
        url: &str,
        target_dir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<PathBuf> {
        let client = self.client()?;

        let bearer = match credentials {
            Some(record @ Credentials::OAuth2 { auth_type, .. }) if auth_type == "oauth2" => {
                Some(self.fetch_oauth2_token(&client, record)?)
            }
            _ => None,
        };

        let mut remaining_retries = self.retries;
        loop {
            let mut request = client.get(url);
            if let Some(token) = &bearer {
                request = request.bearer_auth(token);
            } else if let Some(Credentials::Basic { username, password }) = credentials {
                request = request.basic_auth(username, Some(password));
            }

            match request.send().and_then(|response| response.error_for_status()) {
                Ok(response) => return download_response(response, target_dir),
                Err(error) if error.is_timeout() && remaining_retries > 0 => {
                    // only timeouts are worth retrying
                    tracing::warn!("timeout downloading {}, retrying", url);
                    remaining_retries -= 1;
                }
                Err(error) => {
                    return Err(Error::Download(format!(
                        "error downloading {} (reason: {})",
                        url, error
                    )))
                }
            }
        }
    }
}

impl RemoteBackend for HttpBackend {
    fn identify(&self, url: &str) -> bool {
        url.starts_with(self.prefix)
    }

    fn prefix(&self) -> Option<&str> {
        Some(self.prefix)
    }

    fn pull(
        &self,
        archive: &Archive,
        product: &Properties,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let url = product
            .remote_url()
            .ok_or_else(|| Error::Download("product has no remote_url".to_string()))?;
        let credentials = get_credentials(archive.auth_file(), url)?;
        let file_path = self.download(url, target_dir, credentials.as_ref())?;
        auto_extract(&file_path, product)
    }
}

/// Download a product's remote data into `target_dir`, selecting the backend
/// with the longest matching URL prefix, and optionally verify the download
/// against the catalogued hash.
pub fn pull_files(
    archive: &Archive,
    product: &Properties,
    verify_hash_download: bool,
    target_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let url = product.remote_url().ok_or_else(|| {
        Error::User(format!("product {} not available", product.display_name()))
    })?;

    let mut backend: Option<&dyn RemoteBackend> = None;
    let mut backend_prefix_len = 0;
    for candidate in archive.remote_backend_plugins() {
        if candidate.identify(url) {
            let prefix_len = candidate.prefix().map(str::len).unwrap_or(0);
            if backend.is_none() || prefix_len >= backend_prefix_len {
                backend = Some(candidate);
                backend_prefix_len = prefix_len;
            }
        }
    }
    let backend = backend.ok_or_else(|| {
        Error::User(format!("the protocol of \"{}\" is not supported", url))
    })?;

    let paths = backend.pull(archive, product, target_dir)?;

    if verify_hash_download {
        if let Some(stored_hash) = product.hash() {
            let (hash_type, stored_hash) = match extract_hash_type(stored_hash) {
                Some(algorithm) => (algorithm, stored_hash.to_string()),
                // legacy bare digests imply sha1
                None => (HashAlgorithm::Sha1, format!("sha1:{}", stored_hash)),
            };
            let calculated = product_hash(&paths, hash_type)?;
            if calculated != stored_hash {
                return Err(Error::Download(format!(
                    "hash mismatch when retrieving product {}",
                    product.display_name()
                )));
            }
        }
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use uuid::Uuid;

    fn product(physical_name: &str) -> Properties {
        let mut properties = Properties::with_core();
        let core = properties.core_mut();
        core.set("uuid", Uuid::new_v4());
        core.set("physical_name", physical_name);
        core.set("product_name", physical_name);
        properties
    }

    #[test]
    fn plain_files_pass_through_auto_extract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"plain").unwrap();

        let paths = auto_extract(&path, &product("data.txt")).unwrap();
        assert_eq!(paths, vec![path]);
    }

    #[test]
    fn tar_archives_are_extracted_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar");

        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "bundle/inner.txt", &b"hello"[..])
            .unwrap();
        builder.finish().unwrap();

        let paths = auto_extract(&tar_path, &product("bundle")).unwrap();
        assert_eq!(paths, vec![dir.path().join("bundle")]);
        assert!(dir.path().join("bundle/inner.txt").is_file());
        assert!(!tar_path.exists());
    }

    #[test]
    fn tar_members_escaping_target_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        let tar_path = inner.join("evil.tar");

        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape.txt", &b"evil"[..])
            .unwrap();
        builder.finish().unwrap();

        let paths = auto_extract(&tar_path, &product("evil")).unwrap();
        assert!(paths.is_empty());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn zip_archives_are_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pack.zip");

        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("pack/readme.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"zipped").unwrap();
        writer.finish().unwrap();

        let paths = auto_extract(&zip_path, &product("pack")).unwrap();
        assert_eq!(paths, vec![dir.path().join("pack")]);
        assert!(dir.path().join("pack/readme.txt").is_file());
        assert!(!zip_path.exists());
    }

    #[test]
    fn auth_file_prefix_and_host_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let auth_path = dir.path().join("auth.json");
        std::fs::write(
            &auth_path,
            serde_json::json!({
                "https://example.com/private/": {
                    "username": "alice",
                    "password": "secret"
                },
                "example.org": {
                    "username": "bob",
                    "password": "hunter2"
                }
            })
            .to_string(),
        )
        .unwrap();

        match get_credentials(Some(&auth_path), "https://example.com/private/file").unwrap() {
            Some(Credentials::Basic { username, .. }) => assert_eq!(username, "alice"),
            other => panic!("unexpected credentials: {:?}", other),
        }
        match get_credentials(Some(&auth_path), "https://example.org/file").unwrap() {
            Some(Credentials::Basic { username, .. }) => assert_eq!(username, "bob"),
            other => panic!("unexpected credentials: {:?}", other),
        }
        assert!(get_credentials(Some(&auth_path), "https://other.net/x")
            .unwrap()
            .is_none());
        assert!(get_credentials(None, "https://example.com/").unwrap().is_none());
    }

    #[test]
    fn oauth2_records_deserialize_distinctly() {
        let record: Credentials = serde_json::from_value(serde_json::json!({
            "auth_type": "oauth2",
            "client_id": "id",
            "client_secret": "secret",
            "token_url": "https://auth/token",
            "username": "u",
            "password": "p",
            "grant_type": "ResourceOwnerPasswordCredentialsGrant"
        }))
        .unwrap();
        assert!(matches!(record, Credentials::OAuth2 { .. }));

        let record: Credentials = serde_json::from_value(serde_json::json!({
            "host": "https://s3.example",
            "region": "eu-1",
            "access_key": "ak",
            "secret_access_key": "sk"
        }))
        .unwrap();
        assert!(matches!(record, Credentials::S3 { .. }));
    }
}
