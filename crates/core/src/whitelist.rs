// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hot-reloadable command whitelist: `name -> executable path`.
//!
//! Single-writer/multi-reader: any number of sessions may call `lookup`
//! concurrently while a `SIGHUP`-triggered `reload` is in flight; readers
//! either see the old map in full or the new map in full, never a partial
//! mix, because `reload` only takes the write guard to swap in an already-
//! fully-parsed `HashMap`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use thiserror::Error;

/// Errors produced while loading or reloading the whitelist config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist or could not be read")]
    Missing(String),

    #[error("config file {0} contains no whitelist entries")]
    Empty(String),
}

/// The command whitelist: `name -> executable path`.
pub struct Whitelist {
    map: RwLock<HashMap<String, String>>,
}

impl Whitelist {
    /// Loads the whitelist from `path`. Used at startup, where a missing or
    /// empty config file is a fatal error -- there is no previous map to
    /// fall back to.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let map = parse_config_file(path)?;
        Ok(Self {
            map: RwLock::new(map),
        })
    }

    /// Looks up `name`, returning a clone of the resolved executable path.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.map.read().get(name).cloned()
    }

    /// Re-parses `path` and, only on success, atomically replaces the whole
    /// map. On failure the previous map is left untouched; the caller (the
    /// server's `SIGHUP` handler) is expected to log and continue.
    pub fn reload(&self, path: &Path) -> Result<(), ConfigError> {
        let map = parse_config_file(path)?;
        *self.map.write() = map;
        Ok(())
    }

    /// Number of entries currently loaded. Exposed for tests and logging.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses `name SP+ path` per non-empty line. Blank/whitespace-only lines
/// are ignored; a later duplicate `name` overwrites an earlier one.
fn parse_config_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|_| ConfigError::Missing(path.display().to_string()))?;

    let mut map = HashMap::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(program)) = (fields.next(), fields.next()) else {
            continue;
        };
        map.insert(name.to_owned(), program.to_owned());
    }

    if map.is_empty() {
        return Err(ConfigError::Empty(path.display().to_string()));
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn parses_name_path_pairs() {
        let file = write_config("ls /bin/ls\nuptime /usr/bin/uptime\n");
        let wl = Whitelist::from_file(file.path()).expect("load");
        assert_eq!(wl.lookup("ls").as_deref(), Some("/bin/ls"));
        assert_eq!(wl.lookup("uptime").as_deref(), Some("/usr/bin/uptime"));
        assert_eq!(wl.lookup("nope"), None);
    }

    #[test]
    fn ignores_blank_lines() {
        let file = write_config("ls /bin/ls\n\n   \nuptime /usr/bin/uptime\n");
        let wl = Whitelist::from_file(file.path()).expect("load");
        assert_eq!(wl.len(), 2);
    }

    #[test]
    fn later_duplicate_wins() {
        let file = write_config("ls /bin/ls\nls /usr/bin/ls\n");
        let wl = Whitelist::from_file(file.path()).expect("load");
        assert_eq!(wl.lookup("ls").as_deref(), Some("/usr/bin/ls"));
    }

    #[test]
    fn missing_file_is_fatal_at_startup() {
        let err = Whitelist::from_file(Path::new("/does/not/exist.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = write_config("");
        let err = Whitelist::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Empty(_)));
    }

    #[test]
    fn reload_replaces_whole_map_atomically() {
        let file = write_config("ls /bin/ls\n");
        let wl = Whitelist::from_file(file.path()).expect("load");
        assert_eq!(wl.lookup("ls").as_deref(), Some("/bin/ls"));

        let file2 = write_config("uptime /usr/bin/uptime\n");
        wl.reload(file2.path()).expect("reload");
        assert_eq!(wl.lookup("ls"), None);
        assert_eq!(wl.lookup("uptime").as_deref(), Some("/usr/bin/uptime"));
    }

    #[test]
    fn reload_leaves_old_map_on_failure() {
        let file = write_config("ls /bin/ls\n");
        let wl = Whitelist::from_file(file.path()).expect("load");

        let err = wl.reload(Path::new("/does/not/exist.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
        assert_eq!(wl.lookup("ls").as_deref(), Some("/bin/ls"));
    }
}
