use std::path::Path;

use chrono::DateTime;
use chrono::FixedOffset;
use chrono::Local;
use sha2::Digest;
use sha2::Sha256;
use tracing::warn;

use crate::clock::Clock;
use crate::types::ManifestEntry;

pub const BUNDLE_NAME: &str = "_cfshare_bundle.zip";
pub const BUNDLE_ENTRY_NAME: &str = "download.zip";

/// Walk `workspace_dir` recursively, producing a [`ManifestEntry`] per
/// regular file with its POSIX-relative path, size, SHA-256 digest,
/// URL-encoded relative URL and mtime. Uses a plain `walkdir` pass rather
/// than an `ignore`-aware walker since the workspace is already a
/// sanitized copy with nothing left to filter.
pub fn build_manifest(workspace_dir: &Path, clock: &dyn Clock) -> std::io::Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(workspace_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.file_name().map(|n| n == BUNDLE_NAME).unwrap_or(false) {
            continue;
        }
        let relative = match path.strip_prefix(workspace_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let name = posix_relative(relative);
        let contents = match std::fs::read(path) {
            Ok(c) => c,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read manifest entry");
                continue;
            }
        };
        let digest = Sha256::digest(&contents);
        let metadata = entry.metadata().ok();
        let modified_at = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .map(|t| system_time_to_offset(t, clock))
            .unwrap_or_else(|| clock.now());
        entries.push(ManifestEntry {
            name: name.clone(),
            size: contents.len() as u64,
            sha256: hex::encode(digest),
            relative_url: percent_encoding::utf8_percent_encode(
                &name,
                percent_encoding::NON_ALPHANUMERIC,
            )
            .to_string()
            .replace("%2F", "/"),
            modified_at,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn posix_relative(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn system_time_to_offset(t: std::time::SystemTime, clock: &dyn Clock) -> DateTime<FixedOffset> {
    let offset = *clock.now().offset();
    let datetime: DateTime<Local> = t.into();
    datetime.with_timezone(&offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::tempdir;

    #[test]
    fn builds_entries_for_nested_files() {
        let ws = tempdir().expect("ws");
        std::fs::write(ws.path().join("a.txt"), b"A").expect("write");
        std::fs::create_dir(ws.path().join("sub")).expect("mkdir");
        std::fs::write(ws.path().join("sub").join("b.txt"), b"B").expect("write");

        let clock = SystemClock;
        let entries = build_manifest(ws.path(), &clock).expect("manifest");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
        assert_eq!(entries[0].size, 1);
        assert!(!entries[0].sha256.is_empty());
    }

    #[test]
    fn excludes_the_bundle_file_itself() {
        let ws = tempdir().expect("ws");
        std::fs::write(ws.path().join("a.txt"), b"A").expect("write");
        std::fs::write(ws.path().join(BUNDLE_NAME), b"PK").expect("write");
        let clock = SystemClock;
        let entries = build_manifest(ws.path(), &clock).expect("manifest");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }
}
