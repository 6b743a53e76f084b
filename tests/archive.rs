//! End-to-end tests against a scratch archive (sqlite catalogue, filesystem
//! storage) with a locally registered product type plugin.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use muninn::archive::{Archive, AttachOptions, IngestOptions, Selection};
use muninn::catalogue::sqlite::SqliteConfig;
use muninn::config::{ArchiveConfig, Config, RemoteConfig};
use muninn::extension::{AnalyzeResult, CascadeRule, ProductType, Registry};
use muninn::hash::HashAlgorithm;
use muninn::records::{Properties, Record, Value};
use muninn::storage::fs::FsConfig;

/// Product type used by the tests: one `.txt` file, or a set of files under
/// an enclosing directory named after the product.
struct TextProduct {
    product_type: &'static str,
    use_enclosing_directory: bool,
    hash_type: Option<HashAlgorithm>,
    cascade_rule: CascadeRule,
}

impl TextProduct {
    fn new(product_type: &'static str) -> Self {
        TextProduct {
            product_type,
            use_enclosing_directory: true,
            hash_type: Some(HashAlgorithm::Sha1),
            cascade_rule: CascadeRule::Ignore,
        }
    }
}

impl ProductType for TextProduct {
    fn use_enclosing_directory(&self) -> bool {
        self.use_enclosing_directory
    }

    fn hash_type(&self) -> Option<HashAlgorithm> {
        self.hash_type
    }

    fn cascade_rule(&self) -> CascadeRule {
        self.cascade_rule
    }

    fn identify(&self, paths: &[PathBuf]) -> bool {
        paths
            .iter()
            .all(|path| path.extension().map(|ext| ext == "txt").unwrap_or(false))
    }

    fn analyze(&self, paths: &[PathBuf]) -> muninn::Result<AnalyzeResult> {
        let name = paths[0]
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut properties = Properties::with_core();
        properties.core_mut().set("product_name", name.as_str());
        Ok(AnalyzeResult::new(properties))
    }

    fn archive_path(&self, _properties: &Properties) -> muninn::Result<String> {
        Ok(format!("archive/{}", self.product_type))
    }

    fn enclosing_directory(&self, properties: &Properties) -> muninn::Result<String> {
        Ok(properties.product_name()?.to_string())
    }
}

struct TestArchive {
    _dir: tempfile::TempDir,
    dir: PathBuf,
    archive: Archive,
}

impl TestArchive {
    fn storage_root(&self) -> PathBuf {
        self.dir.join("archive")
    }

    fn write_product(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }
}

fn no_parameters() -> BTreeMap<String, Value> {
    BTreeMap::new()
}

fn make_archive(configure: impl FnOnce(&mut Archive)) -> TestArchive {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    let config = Config {
        archive: ArchiveConfig {
            cascade_grace_period: -1,
            ..ArchiveConfig::default()
        },
        sqlite: Some(SqliteConfig {
            connection_string: path.join("catalogue.db").to_string_lossy().into_owned(),
            table_prefix: String::new(),
        }),
        fs: Some(FsConfig {
            root: path.join("archive").to_string_lossy().into_owned(),
            use_symlinks: None,
        }),
        remote: RemoteConfig::default(),
    };

    let mut archive = Archive::create(&config, Some("test".to_string()), &Registry::new()).unwrap();
    configure(&mut archive);
    archive.prepare(false).unwrap();

    TestArchive {
        dir: path,
        _dir: dir,
        archive,
    }
}

fn default_archive() -> TestArchive {
    make_archive(|archive| {
        archive
            .register_product_type("text", Arc::new(TextProduct::new("text")))
            .unwrap();
    })
}

fn pi_bytes() -> Vec<u8> {
    // 1015 bytes: "3." plus 1013 digits
    let mut contents = String::from("3.");
    while contents.len() < 1015 {
        contents.push_str("14159265358979323846");
    }
    contents.truncate(1015);
    contents.into_bytes()
}

#[test]
fn ingest_single_file() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());

    let properties = fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();

    assert!(properties.active());
    assert_eq!(properties.size(), Some(1015));
    let digest = properties.hash().unwrap();
    assert!(digest.starts_with("sha1:"));
    assert_eq!(properties.archive_path(), Some("archive/text"));

    let stored = fixture
        .storage_root()
        .join("archive/text")
        .join("pi.txt")
        .join("pi.txt");
    assert!(stored.is_file());
    assert_eq!(fs::metadata(&stored).unwrap().len(), 1015);
}

#[test]
fn ingest_multi_file_requires_enclosing_directory() {
    let fixture = make_archive(|archive| {
        let mut plugin = TextProduct::new("text");
        plugin.use_enclosing_directory = false;
        archive
            .register_product_type("text", Arc::new(plugin))
            .unwrap();
    });
    let one = fixture.write_product("1.txt", b"one");
    let two = fixture.write_product("2.txt", b"two");

    let error = fixture
        .archive
        .ingest(&[one, two], IngestOptions::default())
        .unwrap_err();
    assert!(error.to_string().contains("enclosing directory"));
}

#[test]
fn remove_clears_catalogue_and_storage() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    let properties = fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();
    let stored = fixture
        .storage_root()
        .join("archive/text/pi.txt");
    assert!(stored.exists());

    let removed = fixture
        .archive
        .remove("", &no_parameters(), false, true)
        .unwrap();
    assert_eq!(removed, 1);

    assert_eq!(fixture.archive.count("", &no_parameters()).unwrap(), 0);
    assert!(!stored.exists());
    assert!(fixture
        .archive
        .retrieve_properties(properties.uuid().unwrap(), &[], &[])
        .is_err());
}

#[test]
fn search_by_product_name() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();

    let found = fixture
        .archive
        .search(
            "product_name == \"pi.txt\"",
            &[],
            None,
            &no_parameters(),
            &[],
            &[],
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].product_name().unwrap(), "pi.txt");

    let missing = fixture
        .archive
        .search(
            "product_name == \"pr.txt\"",
            &[],
            None,
            &no_parameters(),
            &[],
            &[],
        )
        .unwrap();
    assert!(missing.is_empty());
}

#[test]
fn search_with_parameters_and_null_safe_equality() {
    let fixture = make_archive(|archive| {
        let mut with_hash = TextProduct::new("text");
        with_hash.hash_type = Some(HashAlgorithm::Sha256);
        archive
            .register_product_type("text", Arc::new(with_hash))
            .unwrap();
        let mut without_hash = TextProduct::new("raw");
        without_hash.hash_type = None;
        without_hash.use_enclosing_directory = false;
        archive
            .register_product_type("raw", Arc::new(without_hash))
            .unwrap();
    });

    let hashed = fixture.write_product("hashed.txt", b"hashed");
    fixture
        .archive
        .ingest(
            &[hashed],
            IngestOptions {
                product_type: Some("text".to_string()),
                ..IngestOptions::default()
            },
        )
        .unwrap();

    let unhashed = fixture.write_product("unhashed.txt", b"unhashed");
    fixture
        .archive
        .ingest(
            &[unhashed],
            IngestOptions {
                product_type: Some("raw".to_string()),
                ..IngestOptions::default()
            },
        )
        .unwrap();

    // `!=` also matches products whose hash is NULL
    let not_equal = fixture
        .archive
        .count("hash != \"sha256:0\"", &no_parameters())
        .unwrap();
    assert_eq!(not_equal, 2);

    // `==` never matches NULL
    let equal = fixture
        .archive
        .count("hash == \"sha256:0\"", &no_parameters())
        .unwrap();
    assert_eq!(equal, 0);

    let mut parameters = BTreeMap::new();
    parameters.insert(
        "name".to_string(),
        Value::Text("hashed.txt".to_string()),
    );
    let by_parameter = fixture
        .archive
        .count("product_name == @name", &parameters)
        .unwrap();
    assert_eq!(by_parameter, 1);
}

#[test]
fn tag_and_query_by_tag() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    let properties = fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();
    let uuid = properties.uuid().unwrap();

    fixture
        .archive
        .tag(
            Selection::Uuid(uuid),
            &["mytag".to_string()],
            &no_parameters(),
        )
        .unwrap();
    // tagging twice keeps a single row
    fixture
        .archive
        .tag(
            Selection::Uuid(uuid),
            &["mytag".to_string()],
            &no_parameters(),
        )
        .unwrap();

    assert_eq!(
        fixture.archive.tags(uuid).unwrap(),
        vec!["mytag".to_string()]
    );
    assert_eq!(
        fixture
            .archive
            .count("has_tag(\"mytag\")", &no_parameters())
            .unwrap(),
        1
    );
    assert_eq!(
        fixture
            .archive
            .count("has_tag(\"niks\")", &no_parameters())
            .unwrap(),
        0
    );

    // untag with no explicit tags removes everything
    fixture
        .archive
        .untag(Selection::Uuid(uuid), None, &no_parameters())
        .unwrap();
    assert!(fixture.archive.tags(uuid).unwrap().is_empty());
}

#[test]
fn pull_local_remote_product() {
    let fixture = default_archive();
    let source = fixture.write_product("readme.txt", b"pulled contents");

    let mut properties = Properties::with_core();
    {
        let core = properties.core_mut();
        core.set("uuid", Archive::generate_uuid());
        core.set("active", true);
        core.set("product_type", "text");
        core.set("product_name", "readme.txt");
        core.set("physical_name", "readme.txt");
        core.set("remote_url", format!("file://{}", source.display()).as_str());
    }
    fixture.archive.create_properties(&properties, false).unwrap();

    let pulled = fixture
        .archive
        .pull(
            "active and is_defined(remote_url) and not is_defined(archive_path)",
            &no_parameters(),
            true,
            false,
        )
        .unwrap();
    assert_eq!(pulled, 1);

    let stored = fixture
        .storage_root()
        .join("archive/text/readme.txt/readme.txt");
    assert!(stored.is_file());
    assert_eq!(fs::read(&stored).unwrap(), b"pulled contents");

    let product = fixture
        .archive
        .retrieve_properties(properties.uuid().unwrap(), &[], &[])
        .unwrap();
    assert!(product.active());
    assert!(product
        .namespace("core")
        .unwrap()
        .is_defined("archive_date"));
    assert_eq!(product.size(), Some(15));
}

#[test]
fn strip_then_attach_restores_product() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    let properties = fixture
        .archive
        .ingest(&[path.clone()], IngestOptions::default())
        .unwrap();
    let uuid = properties.uuid().unwrap();
    let stored = fixture.storage_root().join("archive/text/pi.txt");

    let stripped = fixture
        .archive
        .strip("", &no_parameters(), false, true)
        .unwrap();
    assert_eq!(stripped, 1);
    assert!(!stored.exists());

    let product = fixture.archive.retrieve_properties(uuid, &[], &[]).unwrap();
    assert!(product.active());
    assert!(product.archive_path().is_none());
    assert!(!product.namespace("core").unwrap().is_defined("archive_date"));

    // attach is the inverse of strip
    let attached = fixture
        .archive
        .attach(
            &[path],
            AttachOptions {
                verify_hash: true,
                ..AttachOptions::default()
            },
        )
        .unwrap();
    assert_eq!(attached.uuid().unwrap(), uuid);
    assert!(attached.active());
    assert!(stored.join("pi.txt").is_file());
}

#[test]
fn attach_rejects_size_mismatch() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();
    fixture
        .archive
        .strip("", &no_parameters(), false, true)
        .unwrap();

    let tampered = fixture.write_product("pi.txt", b"tampered");
    let error = fixture
        .archive
        .attach(&[tampered], AttachOptions::default())
        .unwrap_err();
    assert!(error.to_string().contains("size mismatch"));
}

#[test]
fn links_are_idempotent_and_cascade_purges_derived() {
    let fixture = make_archive(|archive| {
        archive
            .register_product_type("source", Arc::new(TextProduct::new("source")))
            .unwrap();
        let mut derived = TextProduct::new("derived");
        derived.cascade_rule = CascadeRule::Cascade;
        archive
            .register_product_type("derived", Arc::new(derived))
            .unwrap();
    });

    let source_path = fixture.write_product("source.txt", b"source");
    let source = fixture
        .archive
        .ingest(
            &[source_path],
            IngestOptions {
                product_type: Some("source".to_string()),
                ..IngestOptions::default()
            },
        )
        .unwrap();
    let derived_path = fixture.write_product("derived.txt", b"derived");
    let derived = fixture
        .archive
        .ingest(
            &[derived_path],
            IngestOptions {
                product_type: Some("derived".to_string()),
                ..IngestOptions::default()
            },
        )
        .unwrap();

    let source_uuid = source.uuid().unwrap();
    let derived_uuid = derived.uuid().unwrap();

    fixture.archive.link(derived_uuid, &[source_uuid]).unwrap();
    fixture.archive.link(derived_uuid, &[source_uuid]).unwrap();
    assert_eq!(
        fixture.archive.source_products(derived_uuid).unwrap(),
        vec![source_uuid]
    );
    assert_eq!(
        fixture.archive.derived_products(source_uuid).unwrap(),
        vec![derived_uuid]
    );

    assert_eq!(
        fixture
            .archive
            .count(
                &format!("is_derived_from({})", source_uuid),
                &no_parameters()
            )
            .unwrap(),
        1
    );
    assert_eq!(
        fixture
            .archive
            .count("is_source_of(product_type == \"derived\")", &no_parameters())
            .unwrap(),
        1
    );

    // removing the source cascades into the derived product
    fixture
        .archive
        .remove(Selection::Uuid(source_uuid), &no_parameters(), false, true)
        .unwrap();
    assert_eq!(fixture.archive.count("", &no_parameters()).unwrap(), 0);
}

#[test]
fn unlink_removes_outbound_links_only() {
    let fixture = default_archive();
    let first = fixture.write_product("first.txt", b"first");
    let second = fixture.write_product("second.txt", b"second");
    let first = fixture
        .archive
        .ingest(&[first], IngestOptions::default())
        .unwrap();
    let second = fixture
        .archive
        .ingest(&[second], IngestOptions::default())
        .unwrap();

    let first_uuid = first.uuid().unwrap();
    let second_uuid = second.uuid().unwrap();
    let external = Uuid::new_v4();

    fixture
        .archive
        .link(first_uuid, &[second_uuid, external])
        .unwrap();
    fixture.archive.link(second_uuid, &[external]).unwrap();

    fixture.archive.unlink(first_uuid, None).unwrap();
    assert!(fixture.archive.source_products(first_uuid).unwrap().is_empty());
    // inbound links of other products are untouched
    assert_eq!(
        fixture.archive.source_products(second_uuid).unwrap(),
        vec![external]
    );
}

#[test]
fn rebuild_properties_preserves_identity_and_reconciles_hash() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    let properties = fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();
    let uuid = properties.uuid().unwrap();
    let sha1_digest = properties.hash().unwrap().to_string();

    fixture
        .archive
        .rebuild_properties(uuid, true, false)
        .unwrap();

    let rebuilt = fixture.archive.retrieve_properties(uuid, &[], &[]).unwrap();
    assert_eq!(rebuilt.uuid().unwrap(), uuid);
    assert_eq!(rebuilt.hash(), Some(sha1_digest.as_str()));
    assert_eq!(rebuilt.product_name().unwrap(), "pi.txt");
    assert_eq!(rebuilt.size(), Some(1015));
}

#[test]
fn verify_hash_detects_tampering() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    let properties = fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();
    let uuid = properties.uuid().unwrap();

    assert!(fixture
        .archive
        .verify_hash("", &no_parameters())
        .unwrap()
        .is_empty());

    let stored = fixture
        .storage_root()
        .join("archive/text/pi.txt/pi.txt");
    fs::write(&stored, b"tampered").unwrap();

    assert_eq!(
        fixture.archive.verify_hash("", &no_parameters()).unwrap(),
        vec![uuid]
    );
}

#[test]
fn retrieve_copies_product_files() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();

    let target = fixture.dir.join("retrieved");
    fs::create_dir(&target).unwrap();
    let retrieved = fixture
        .archive
        .retrieve("", &no_parameters(), &target, false)
        .unwrap();
    assert_eq!(retrieved.len(), 1);
    // the enclosing directory itself is not part of the retrieved product
    assert_eq!(retrieved[0], target.join("pi.txt"));
    assert_eq!(fs::metadata(target.join("pi.txt")).unwrap().len(), 1015);
}

#[test]
fn summary_groups_and_counts() {
    let fixture = default_archive();
    for name in ["a.txt", "b.txt"] {
        let path = fixture.write_product(name, b"data");
        fixture
            .archive
            .ingest(&[path], IngestOptions::default())
            .unwrap();
    }

    let (rows, header) = fixture
        .archive
        .summary(
            "",
            &no_parameters(),
            &["core.size.sum".to_string()],
            &["core.product_type".to_string()],
            false,
            None,
            &[],
        )
        .unwrap();

    assert_eq!(
        header,
        vec![
            "core.product_type".to_string(),
            "count".to_string(),
            "core.size.sum".to_string(),
        ]
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Value::Text("text".to_string()));
    assert_eq!(rows[0][1], Value::Long(2));
    assert_eq!(rows[0][2], Value::Long(8));
}

#[test]
fn extension_namespace_round_trip() {
    use muninn::schema::{DataType, Field, Schema};

    struct NamespacedProduct;

    impl ProductType for NamespacedProduct {
        fn use_enclosing_directory(&self) -> bool {
            false
        }

        fn hash_type(&self) -> Option<HashAlgorithm> {
            None
        }

        fn namespaces(&self) -> Vec<String> {
            vec!["mynamespace".to_string()]
        }

        fn identify(&self, _paths: &[PathBuf]) -> bool {
            true
        }

        fn analyze(&self, paths: &[PathBuf]) -> muninn::Result<AnalyzeResult> {
            let name = paths[0]
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut properties = Properties::with_core();
            properties.core_mut().set("product_name", name.as_str());
            let mut extra = Record::new();
            extra.set("hello", "world");
            properties.set_namespace("mynamespace", extra);
            Ok(AnalyzeResult::new(properties))
        }

        fn archive_path(&self, _properties: &Properties) -> muninn::Result<String> {
            Ok("ns".to_string())
        }
    }

    let fixture = make_archive(|archive| {
        archive
            .register_namespace(
                "mynamespace",
                Schema::new()
                    .with_field(Field::new("hello", DataType::Text).optional().indexed()),
            )
            .unwrap();
        archive
            .register_product_type("namespaced", Arc::new(NamespacedProduct))
            .unwrap();
    });

    let path = fixture.write_product("data.txt", b"data");
    let properties = fixture
        .archive
        .ingest(&[path], IngestOptions::default())
        .unwrap();

    let found = fixture
        .archive
        .search(
            "mynamespace.hello == \"world\"",
            &[],
            None,
            &no_parameters(),
            &["mynamespace".to_string()],
            &[],
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].uuid().unwrap(), properties.uuid().unwrap());
    assert_eq!(
        found[0]
            .namespace("mynamespace")
            .unwrap()
            .get_text("hello"),
        Some("world")
    );

    // is_defined on the bare namespace probes for the namespace record
    assert_eq!(
        fixture
            .archive
            .count("is_defined(mynamespace)", &no_parameters())
            .unwrap(),
        1
    );
}

#[test]
fn force_ingest_replaces_existing_product() {
    let fixture = default_archive();
    let path = fixture.write_product("pi.txt", &pi_bytes());
    let first = fixture
        .archive
        .ingest(&[path.clone()], IngestOptions::default())
        .unwrap();

    // same type and name again fails without force
    let duplicate = fixture.write_product("pi.txt", &pi_bytes());
    assert!(fixture
        .archive
        .ingest(&[duplicate.clone()], IngestOptions::default())
        .is_err());

    let second = fixture
        .archive
        .ingest(
            &[duplicate],
            IngestOptions {
                force: true,
                ..IngestOptions::default()
            },
        )
        .unwrap();
    assert_ne!(first.uuid().unwrap(), second.uuid().unwrap());
    assert_eq!(fixture.archive.count("", &no_parameters()).unwrap(), 1);
}

#[test]
fn catalogue_only_archive_sets_remote_url() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        archive: ArchiveConfig {
            storage: "none".to_string(),
            ..ArchiveConfig::default()
        },
        sqlite: Some(SqliteConfig {
            connection_string: dir
                .path()
                .join("catalogue.db")
                .to_string_lossy()
                .into_owned(),
            table_prefix: String::new(),
        }),
        fs: None,
        remote: RemoteConfig::default(),
    };
    let mut archive =
        Archive::create(&config, Some("test".to_string()), &Registry::new()).unwrap();
    archive
        .register_product_type("text", Arc::new(TextProduct::new("text")))
        .unwrap();
    archive.prepare(false).unwrap();

    let path = dir.path().join("pi.txt");
    fs::write(&path, b"3.14").unwrap();
    let properties = archive.ingest(&[path.clone()], IngestOptions::default()).unwrap();

    assert!(properties.active());
    assert!(properties.archive_path().is_none());
    let remote_url = properties.remote_url().unwrap();
    assert!(remote_url.starts_with("file://"));
    assert!(Path::new(remote_url.trim_start_matches("file://")).is_file());
}

#[test]
fn order_by_and_limit() {
    let fixture = default_archive();
    for name in ["c.txt", "a.txt", "b.txt"] {
        let path = fixture.write_product(name, b"data");
        fixture
            .archive
            .ingest(&[path], IngestOptions::default())
            .unwrap();
    }

    let products = fixture
        .archive
        .search(
            "",
            &["+product_name".to_string()],
            Some(2),
            &no_parameters(),
            &[],
            &["product_name".to_string()],
        )
        .unwrap();
    let names: Vec<&str> = products
        .iter()
        .map(|product| product.product_name().unwrap())
        .collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
}
