// Migration files on disk: `<version>_<name>.sql`, optionally paired with
// `<version>_<name>.down.sql` for reverts

use anyhow::{bail, Context, Result};
use pgkit::Migration;
use std::fs;
use std::path::{Path, PathBuf};

const DOWN_SUFFIX: &str = ".down.sql";
const UP_SUFFIX: &str = ".sql";

/// Split `001_create_users` into its version and a readable name
fn parse_stem(stem: &str) -> Option<(String, String)> {
    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || name.is_empty() {
        return None;
    }
    Some((version.to_string(), name.replace('_', " ")))
}

/// Every up migration in `dir`, ascending by version
pub fn load_migrations(dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.ends_with(DOWN_SUFFIX) || !file_name.ends_with(UP_SUFFIX) {
            continue;
        }
        let stem = &file_name[..file_name.len() - UP_SUFFIX.len()];
        let Some((version, name)) = parse_stem(stem) else {
            bail!("{} does not follow <version>_<name>.sql", path.display());
        };
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        migrations.push(Migration::new(version, name, sql));
    }

    migrations.sort_by(|a, b| a.version.cmp(&b.version));
    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        bail!("version {} appears in more than one file", pair[0].version);
    }
    Ok(migrations)
}

/// Path of the down script for `version`, if one exists
pub fn find_down_script(dir: &Path, version: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{}_", version);
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(DOWN_SUFFIX));
        if matches {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Contents of the down script for `version`. A missing script is an error so a
/// revert never forgets a version whose schema change is still in place.
pub fn read_down_script(dir: &Path, version: &str) -> Result<String> {
    let Some(path) = find_down_script(dir, version)? else {
        bail!(
            "no {}_<name>{} in {}; cannot revert {} without undoing it",
            version,
            DOWN_SUFFIX,
            dir.display(),
            version
        );
    };
    fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    #[test]
    fn test_loads_up_scripts_in_version_order() {
        let dir = TempDir::new().unwrap();
        write(&dir, "002_add_email.sql", "ALTER TABLE users ADD COLUMN email TEXT");
        write(&dir, "001_create_users.sql", "CREATE TABLE users (id SERIAL PRIMARY KEY)");
        write(&dir, "002_add_email.down.sql", "ALTER TABLE users DROP COLUMN email");
        write(&dir, "README.md", "ignored");

        let migrations = load_migrations(dir.path()).unwrap();
        let versions: Vec<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["001", "002"]);
        assert_eq!(migrations[0].name, "create users");
    }

    #[test]
    fn test_rejects_badly_named_and_duplicate_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "initial.sql", "SELECT 1");
        assert!(load_migrations(dir.path()).is_err());

        let dir = TempDir::new().unwrap();
        write(&dir, "001_a.sql", "SELECT 1");
        write(&dir, "001_b.sql", "SELECT 2");
        assert!(load_migrations(dir.path()).is_err());
    }

    #[test]
    fn test_finds_down_script() {
        let dir = TempDir::new().unwrap();
        write(&dir, "003_index.sql", "CREATE INDEX i ON t (c)");
        write(&dir, "003_index.down.sql", "DROP INDEX i");

        let down = find_down_script(dir.path(), "003").unwrap().unwrap();
        assert!(down.ends_with("003_index.down.sql"));
        assert!(find_down_script(dir.path(), "004").unwrap().is_none());
    }

    #[test]
    fn test_missing_down_script_refuses_revert() {
        let dir = TempDir::new().unwrap();
        write(&dir, "005_seed.sql", "INSERT INTO t VALUES (1)");
        write(&dir, "006_index.down.sql", "DROP INDEX i");

        let err = read_down_script(dir.path(), "005").unwrap_err();
        assert!(err.to_string().contains("cannot revert 005"));
        assert_eq!(read_down_script(dir.path(), "006").unwrap(), "DROP INDEX i");
    }
}
