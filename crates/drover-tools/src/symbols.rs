//! Persistent symbol index.
//!
//! The index is keyed by a content fingerprint of the walked file set
//! (path, mtime, size). On a fingerprint match the cached
//! `.drover-cache/symbols.jsonl` is loaded; otherwise a
//! universal-ctags-compatible binary is invoked with JSON output and its
//! stdout is streamed line-by-line into entries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use drover_domain::cancel::CancelToken;
use drover_domain::{Error, Result};

use crate::exec::look_path;

const CACHE_DIR: &str = ".drover-cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub file: String,
    pub line: u32,
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    fingerprint: String,
    source: String,
    generated_at: String,
}

/// Build the formatted repo map, capped at `max_symbols` entries.
pub async fn build_repo_map(
    workspace: &Path,
    files: &[String],
    max_symbols: usize,
    cancel: Option<&CancelToken>,
) -> Result<String> {
    let mut entries = load_or_build_index(workspace, files, cancel).await?;
    sort_entries(&mut entries);
    if max_symbols > 0 {
        entries.truncate(max_symbols);
    }
    Ok(format_entries(&entries))
}

async fn load_or_build_index(
    workspace: &Path,
    files: &[String],
    cancel: Option<&CancelToken>,
) -> Result<Vec<SymbolEntry>> {
    let ctags = look_path("ctags").ok_or_else(|| {
        Error::Other("ctags is required; install universal-ctags and ensure it is on PATH".into())
    })?;

    let (index_path, meta_path) = cache_paths(workspace)?;
    let fingerprint = compute_fingerprint(workspace, files);
    if let Some(meta) = load_meta(&meta_path) {
        if meta.fingerprint == fingerprint && index_path.exists() {
            return Ok(load_index_entries(&index_path));
        }
    }

    let entries = build_ctags_index(&ctags, workspace, files, cancel).await?;
    write_index_entries(&index_path, &entries)?;
    write_meta(&meta_path, &fingerprint)?;
    Ok(entries)
}

fn cache_paths(workspace: &Path) -> Result<(PathBuf, PathBuf)> {
    let cache = workspace.join(CACHE_DIR);
    std::fs::create_dir_all(&cache)?;
    Ok((cache.join("symbols.jsonl"), cache.join("symbols.meta.json")))
}

/// SHA-256 over sorted `(relpath, mtime_ns, size)` of the walked set.
fn compute_fingerprint(workspace: &Path, files: &[String]) -> String {
    let mut sorted: Vec<&String> = files.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for rel in sorted {
        let Ok(meta) = workspace.join(rel).metadata() else {
            continue;
        };
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        hasher.update(rel.as_bytes());
        hasher.update(mtime_ns.to_string().as_bytes());
        hasher.update(meta.len().to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn load_meta(path: &Path) -> Option<IndexMeta> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_meta(path: &Path, fingerprint: &str) -> Result<()> {
    let meta = IndexMeta {
        fingerprint: fingerprint.to_owned(),
        source: "ctags".into(),
        generated_at: chrono::Utc::now().to_rfc3339(),
    };
    let mut payload = serde_json::to_string_pretty(&meta)?;
    payload.push('\n');
    std::fs::write(path, payload)?;
    Ok(())
}

fn load_index_entries(path: &Path) -> Vec<SymbolEntry> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str::<SymbolEntry>(line)
                .ok()
                .filter(|e| !e.file.is_empty() && !e.name.is_empty())
        })
        .collect()
}

fn write_index_entries(path: &Path, entries: &[SymbolEntry]) -> Result<()> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

async fn build_ctags_index(
    ctags: &Path,
    workspace: &Path,
    files: &[String],
    cancel: Option<&CancelToken>,
) -> Result<Vec<SymbolEntry>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    // ctags runs with the workspace as cwd, so relative paths line up.
    let list_path = workspace.join(CACHE_DIR).join("symbols.files");
    std::fs::write(&list_path, files.join("\n"))?;

    let mut child = Command::new(ctags)
        .args([
            "--output-format=json",
            "--fields=+n",
            "--excmd=number",
            "--sort=no",
            "-f",
            "-",
            "-L",
        ])
        .arg(&list_path)
        .current_dir(workspace)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Other("ctags stdout unavailable".into()))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut entries = Vec::new();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(raw) => {
                        if let Some(entry) = parse_ctags_line(&raw, workspace) {
                            entries.push(entry);
                        }
                    }
                    None => break,
                }
            }
            _ = wait_cancelled(cancel) => {
                let reason = cancel.map(|t| t.reason()).unwrap_or_else(|| "canceled".into());
                return Err(Error::Canceled(reason));
            }
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            String::new()
        } else {
            format!(": {}", stderr.trim())
        };
        return Err(Error::Other(format!(
            "ctags failed with exit code {}{detail}",
            output.status.code().unwrap_or(1)
        )));
    }
    Ok(entries)
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn parse_ctags_line(raw: &str, workspace: &Path) -> Option<SymbolEntry> {
    #[derive(Deserialize)]
    struct CtagsTag {
        #[serde(rename = "_type")]
        tag_type: Option<String>,
        name: Option<String>,
        path: Option<String>,
        line: Option<u32>,
        kind: Option<String>,
        language: Option<String>,
    }

    let line = raw.trim();
    if line.is_empty() {
        return None;
    }
    let tag: CtagsTag = serde_json::from_str(line).ok()?;
    if let Some(tag_type) = &tag.tag_type {
        if tag_type != "tag" {
            return None;
        }
    }
    let name = tag.name?;
    let path = tag.path?;
    if name.is_empty() || path.is_empty() {
        return None;
    }

    let file = Path::new(&path)
        .strip_prefix(workspace)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(path);
    Some(SymbolEntry {
        file: file.replace('\\', "/"),
        line: tag.line.unwrap_or(0),
        name,
        kind: tag.kind.unwrap_or_default(),
        language: tag.language,
    })
}

fn sort_entries(entries: &mut [SymbolEntry]) {
    entries.sort_by(|a, b| {
        (a.file.as_str(), a.line, a.name.as_str()).cmp(&(b.file.as_str(), b.line, b.name.as_str()))
    });
}

/// Group entries by file for the prompt context block.
fn format_entries(entries: &[SymbolEntry]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut last_file = "";
    for entry in entries {
        if entry.file != last_file {
            if !last_file.is_empty() {
                out.push(String::new());
            }
            out.push(format!("{}:", entry.file));
            last_file = &entry.file;
        }
        let label = match &entry.language {
            Some(lang) => format!("{} [{lang}]", entry.kind),
            None => entry.kind.clone(),
        };
        out.push(format!("  - {label} {} (line {})", entry.name, entry.line));
    }
    out.join("\n").trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str, line: u32, name: &str, kind: &str) -> SymbolEntry {
        SymbolEntry {
            file: file.into(),
            line,
            name: name.into(),
            kind: kind.into(),
            language: None,
        }
    }

    #[test]
    fn fingerprint_tracks_file_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        let one = compute_fingerprint(dir.path(), &["a.rs".into()]);
        let same = compute_fingerprint(dir.path(), &["a.rs".into()]);
        assert_eq!(one, same);

        std::fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();
        let two = compute_fingerprint(dir.path(), &["a.rs".into(), "b.rs".into()]);
        assert_ne!(one, two);

        // Order of the walked set must not matter.
        let reversed = compute_fingerprint(dir.path(), &["b.rs".into(), "a.rs".into()]);
        assert_eq!(two, reversed);
    }

    #[test]
    fn index_entries_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("symbols.jsonl");
        let entries = vec![entry("src/a.rs", 3, "alpha", "function")];
        write_index_entries(&path, &entries).unwrap();

        // A malformed line must be skipped on load.
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("garbage\n");
        std::fs::write(&path, raw).unwrap();

        let loaded = load_index_entries(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "alpha");
    }

    #[test]
    fn parse_ctags_tag_line() {
        let ws = Path::new("/ws");
        let raw = r#"{"_type":"tag","name":"main","path":"src/main.rs","line":10,"kind":"function","language":"Rust"}"#;
        let entry = parse_ctags_line(raw, ws).unwrap();
        assert_eq!(entry.file, "src/main.rs");
        assert_eq!(entry.line, 10);
        assert_eq!(entry.language.as_deref(), Some("Rust"));

        // Non-tag records and garbage are ignored.
        assert!(parse_ctags_line(r#"{"_type":"ptag","name":"x","path":"y"}"#, ws).is_none());
        assert!(parse_ctags_line("nonsense", ws).is_none());
    }

    #[test]
    fn format_groups_by_file() {
        let mut entries = vec![
            entry("b.rs", 2, "beta", "function"),
            entry("a.rs", 5, "alpha2", "struct"),
            entry("a.rs", 1, "alpha1", "function"),
        ];
        sort_entries(&mut entries);
        let text = format_entries(&entries);
        let expected = "a.rs:\n  - function alpha1 (line 1)\n  - struct alpha2 (line 5)\n\nb.rs:\n  - function beta (line 2)";
        assert_eq!(text, expected);
    }
}
