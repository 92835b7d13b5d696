use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::write::FileOptions;
use zip::ZipWriter;

use sha2::Digest;
use sha2::Sha256;

use super::manifest::BUNDLE_ENTRY_NAME;
use super::manifest::BUNDLE_NAME;
use crate::clock::Clock;
use crate::error::CfshareError;
use crate::error::Result;
use crate::types::ManifestEntry;

/// Build `_cfshare_bundle.zip` inside `workspace_dir` containing every
/// manifest entry at its workspace-relative path.
pub fn build_bundle(workspace_dir: &Path, entries: &[ManifestEntry]) -> Result<()> {
    let bundle_path = workspace_dir.join(BUNDLE_NAME);
    let file = File::create(&bundle_path)
        .map_err(|e| CfshareError::Internal(format!("failed to create zip bundle: {e}")))?;
    let mut writer = ZipWriter::new(file);
    let options: FileOptions<()> =
        FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in entries {
        writer
            .start_file(&entry.name, options)
            .map_err(|e| CfshareError::Internal(format!("zip entry {}: {e}", entry.name)))?;
        let contents = std::fs::read(workspace_dir.join(&entry.name))
            .map_err(|e| CfshareError::Internal(format!("{}: {e}", entry.name)))?;
        writer
            .write_all(&contents)
            .map_err(|e| CfshareError::Internal(format!("zip write {}: {e}", entry.name)))?;
    }

    writer
        .finish()
        .map_err(|e| CfshareError::Internal(format!("failed to finalize zip bundle: {e}")))?;
    Ok(())
}

/// Build the bundle on disk and return the manifest entry that represents
/// it (`download.zip`), computed the same way `build_manifest` computes
/// every other entry.
pub fn build_bundle_entry(
    workspace_dir: &Path,
    entries: &[ManifestEntry],
    clock: &dyn Clock,
) -> Result<ManifestEntry> {
    build_bundle(workspace_dir, entries)?;
    let bundle_path = workspace_dir.join(BUNDLE_NAME);
    let contents = std::fs::read(&bundle_path)?;
    let digest = Sha256::digest(&contents);
    Ok(ManifestEntry {
        name: BUNDLE_ENTRY_NAME.to_string(),
        size: contents.len() as u64,
        sha256: hex::encode(digest),
        relative_url: BUNDLE_ENTRY_NAME.to_string(),
        modified_at: clock.now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::static_origin::manifest::build_manifest;
    use tempfile::tempdir;

    #[test]
    fn bundle_contains_every_manifest_entry() {
        let ws = tempdir().expect("ws");
        std::fs::write(ws.path().join("a.txt"), b"A").expect("write");
        std::fs::write(ws.path().join("b.txt"), b"B").expect("write");
        let clock = SystemClock;
        let entries = build_manifest(ws.path(), &clock).expect("manifest");

        build_bundle(ws.path(), &entries).expect("bundle");
        let bundle_path = ws.path().join(BUNDLE_NAME);
        assert!(bundle_path.is_file());

        let file = File::open(&bundle_path).expect("open");
        let mut archive = zip::ZipArchive::new(file).expect("archive");
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn bundle_entry_has_download_zip_name() {
        let ws = tempdir().expect("ws");
        std::fs::write(ws.path().join("a.txt"), b"A").expect("write");
        let clock = SystemClock;
        let entries = build_manifest(ws.path(), &clock).expect("manifest");
        let bundle_entry = build_bundle_entry(ws.path(), &entries, &clock).expect("bundle entry");
        assert_eq!(bundle_entry.name, BUNDLE_ENTRY_NAME);
        assert!(bundle_entry.size > 0);
    }
}
