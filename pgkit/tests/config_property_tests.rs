// Property-based tests for layered configuration loading

use pgkit::Settings;
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

proptest! {
    /// Values written to default.toml come back unchanged, and a pool sized
    /// with min <= max always validates
    #[test]
    fn property_database_section_round_trips(
        host in "[a-z][a-z0-9-]{0,20}",
        port in 1u16..=65535,
        database in "[a-z][a-z0-9_]{0,20}",
        max_size in 1u32..100,
        min_offset in 0u32..100,
        command_timeout in 1u64..600,
    ) {
        let min_size = min_offset % (max_size + 1);
        let temp_dir = TempDir::new().unwrap();
        let config = format!(
            r#"
[database]
host = "{host}"
port = {port}
database = "{database}"
user = "app"
password = "secret"
min_size = {min_size}
max_size = {max_size}
command_timeout_seconds = {command_timeout}

[observability]
log_level = "debug"
"#
        );
        fs::write(temp_dir.path().join("default.toml"), config).unwrap();

        let settings = Settings::load_from_path(temp_dir.path()).unwrap();
        prop_assert_eq!(&settings.database.host, &host);
        prop_assert_eq!(settings.database.port, port);
        prop_assert_eq!(&settings.database.database, &database);
        prop_assert_eq!(settings.database.min_size, min_size);
        prop_assert_eq!(settings.database.max_size, max_size);
        prop_assert_eq!(settings.observability.log_level.as_str(), "debug");
        prop_assert!(settings.validate().is_ok());
        let database_debug = format!("{:?}", settings.database);
        prop_assert!(!database_debug.contains("secret"));
        prop_assert!(!settings.database.redacted_url().contains("secret"));
    }

    /// local.toml overrides default.toml key by key
    #[test]
    fn property_local_file_overrides_defaults(max_size in 1u32..50, local_max in 1u32..50) {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("default.toml"),
            format!("[database]\nmin_size = 0\nmax_size = {max_size}\nhost = \"db\"\n"),
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("local.toml"),
            format!("[database]\nmax_size = {local_max}\n"),
        )
        .unwrap();

        let settings = Settings::load_from_path(temp_dir.path()).unwrap();
        prop_assert_eq!(settings.database.max_size, local_max);
        prop_assert_eq!(settings.database.host.as_str(), "db");
    }
}

#[test]
fn test_missing_files_fall_back_to_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::load_from_path(temp_dir.path()).unwrap();
    assert_eq!(settings.database.port, 5432);
    assert_eq!(settings.database.max_size, 20);
    assert!(settings.validate().is_ok());
}
