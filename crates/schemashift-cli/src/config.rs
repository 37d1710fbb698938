//! Configuration file handling.
//!
//! Looks for `.config/schemashift.toml` in the current directory or any parent
//! directory, unless a path is given explicitly.

use camino::{Utf8Path, Utf8PathBuf};
use schemashift_config::{Config, ConfigError};

const CONFIG_FILE: &str = ".config/schemashift.toml";

/// Load, override from the environment, validate, and resolve paths.
pub fn load(explicit: Option<&Utf8Path>) -> Result<(Config, Utf8PathBuf), ConfigError> {
    let path = match explicit {
        Some(path) => path.to_owned(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| ConfigError::Io {
                path: ".".to_string(),
                message: e.to_string(),
            })?;
            let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|p| ConfigError::Io {
                path: p.display().to_string(),
                message: "current directory is not valid UTF-8".to_string(),
            })?;
            find_config_file(&cwd)?
        }
    };
    let config = load_from(&path, |key| std::env::var(key).ok())?;
    Ok((config, path))
}

/// Load a specific file, using `lookup` for `PG*` overrides.
pub fn load_from(
    path: &Utf8Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let mut config = Config::from_toml_str(&content)?;
    config.database.apply_env(lookup)?;
    config.validate()?;
    config.resolve_paths(&project_root(path));
    Ok(config)
}

/// Find `.config/schemashift.toml` by searching up the directory tree.
fn find_config_file(start: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(config_path);
        }

        if !current.pop() {
            return Err(ConfigError::NotFound);
        }
    }
}

/// Relative paths in the file are relative to the directory holding `.config/`.
fn project_root(config_path: &Utf8Path) -> Utf8PathBuf {
    let dir = config_path.parent().unwrap_or(Utf8Path::new("."));
    match dir.file_name() {
        Some(".config") => dir.parent().unwrap_or(dir).to_path_buf(),
        _ => dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemashift_config::LedgerConfig;

    const MINIMAL: &str = r#"
model = "schema/model.toml"

[database]
dbname = "shop"
username = "shop"

[ledger]
kind = "file"
path = "ledger.jsonl"
"#;

    fn write_project() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join(".config")).unwrap();
        std::fs::create_dir_all(root.join("nested/deeper")).unwrap();
        std::fs::write(root.join(CONFIG_FILE), MINIMAL).unwrap();
        (dir, root)
    }

    #[test]
    fn test_finds_config_in_parent() {
        let (_dir, root) = write_project();
        let found = find_config_file(&root.join("nested/deeper")).unwrap();
        assert_eq!(found, root.join(CONFIG_FILE));
    }

    #[test]
    fn test_paths_resolve_against_project_root() {
        let (_dir, root) = write_project();
        let config = load_from(&root.join(CONFIG_FILE), |_| None).unwrap();
        assert_eq!(config.model, root.join("schema/model.toml"));
        match config.ledger {
            LedgerConfig::File { path } => assert_eq!(path, root.join("ledger.jsonl")),
            other => panic!("unexpected ledger {:?}", other),
        }
    }

    #[test]
    fn test_environment_overrides_file() {
        let (_dir, root) = write_project();
        let config = load_from(&root.join(CONFIG_FILE), |key| match key {
            "PGHOST" => Some("db.internal".to_string()),
            "PGPASSWORD" => Some("hunter2".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.password.as_deref(), Some("hunter2"));
        assert_eq!(config.database.database, "shop");
    }
}
