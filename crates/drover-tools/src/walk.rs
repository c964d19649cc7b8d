//! Bounded workspace walks.

use std::collections::HashSet;
use std::path::Path;

use walkdir::WalkDir;

use drover_domain::{Error, Result};

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub max_files: usize,
    pub max_depth: usize,
    pub skip_dir_names: HashSet<String>,
}

pub fn default_walk_options() -> WalkOptions {
    let skip = [
        ".git",
        "node_modules",
        "vendor",
        "dist",
        "build",
        "bin",
        "target",
        ".drover",
        ".drover-cache",
    ];
    WalkOptions {
        max_files: 5000,
        max_depth: 30,
        skip_dir_names: skip.iter().map(|s| s.to_string()).collect(),
    }
}

/// List workspace-relative POSIX file paths, depth- and count-bounded.
pub fn walk_files(root: &Path, opts: &WalkOptions) -> Result<Vec<String>> {
    if opts.max_files == 0 {
        return Err(Error::InvalidInput("max_files must be > 0".into()));
    }
    if !root.exists() {
        return Err(Error::NotFound(format!("workspace: {}", root.display())));
    }
    let max_depth = if opts.max_depth == 0 { 30 } else { opts.max_depth };

    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !opts.skip_dir_names.contains(name.as_ref())
        });

    for entry in walker {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        out.push(rel.to_string_lossy().replace('\\', "/"));
        if out.len() >= opts.max_files {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_tree(root: &Path) {
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("README.md"), "x").unwrap();
        std::fs::write(root.join("src/main.rs"), "x").unwrap();
        std::fs::write(root.join("src/nested/mod.rs"), "x").unwrap();
        std::fs::write(root.join(".git/objects/blob"), "x").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
    }

    #[test]
    fn skips_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());

        let mut files = walk_files(dir.path(), &default_walk_options()).unwrap();
        files.sort();
        assert_eq!(files, vec!["README.md", "src/main.rs", "src/nested/mod.rs"]);
    }

    #[test]
    fn honors_max_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());

        let mut opts = default_walk_options();
        opts.max_files = 2;
        let files = walk_files(dir.path(), &opts).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn honors_max_depth() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());

        let mut opts = default_walk_options();
        opts.max_depth = 1;
        let files = walk_files(dir.path(), &opts).unwrap();
        assert_eq!(files, vec!["README.md"]);
    }

    #[test]
    fn missing_root_errors() {
        assert!(walk_files(Path::new("/no/such/dir"), &default_walk_options()).is_err());
    }
}
