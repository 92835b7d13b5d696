use std::path::Path;
use std::path::PathBuf;

use crate::error::CfshareError;
use crate::error::Result;
use crate::policy::Policy;
use crate::policy::IgnoreMatcher;
use crate::util::filename::dedupe_name;
use crate::util::filename::sanitize_filename;

/// Copy each accepted input into `workspace_dir` under a sanitized,
/// collision-resolved base name. Rejects inputs that are ignored,
/// outside `allowedPathRoots`, or neither a file nor a directory.
pub fn build_workspace(
    inputs: &[PathBuf],
    workspace_dir: &Path,
    cwd: &Path,
    ignore_matcher: &IgnoreMatcher,
    policy: &Policy,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(workspace_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(workspace_dir, std::fs::Permissions::from_mode(0o700));
    }

    let mut copied = Vec::new();
    let mut existing_names: Vec<String> = Vec::new();

    for input in inputs {
        let resolved = input
            .canonicalize()
            .map_err(|e| CfshareError::InvalidInput(format!("{}: {e}", input.display())))?;

        if ignore_matcher.is_ignored(cwd, &resolved) {
            return Err(CfshareError::PolicyViolation(format!(
                "input ignored by policy: {}",
                input.display()
            )));
        }
        if !policy.is_path_allowed(&resolved) {
            return Err(CfshareError::PolicyViolation(format!(
                "input outside allowed path roots: {}",
                input.display()
            )));
        }
        let metadata = std::fs::metadata(&resolved)?;
        if !metadata.is_file() && !metadata.is_dir() {
            return Err(CfshareError::InvalidInput(format!(
                "input is neither a file nor a directory: {}",
                input.display()
            )));
        }

        let base_name = resolved
            .file_name()
            .map(|n| sanitize_filename(&n.to_string_lossy()))
            .unwrap_or_else(|| "input".to_string());
        let final_name = dedupe_name(&base_name, &existing_names);
        existing_names.push(final_name.clone());

        let dest = workspace_dir.join(&final_name);
        if metadata.is_dir() {
            copy_dir_recursive(&resolved, &dest)?;
        } else {
            std::fs::copy(&resolved, &dest)?;
        }
        copied.push(dest);
    }

    Ok(copied)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copies_files_with_collision_suffixes() {
        let src_dir = tempdir().expect("src");
        let cwd = src_dir.path();
        std::fs::write(cwd.join("a.txt"), b"A").expect("write");
        let subdir = cwd.join("x");
        std::fs::create_dir(&subdir).expect("mkdir");
        std::fs::write(subdir.join("a.txt"), b"X-A").expect("write");

        let ws = tempdir().expect("ws");
        let matcher = IgnoreMatcher::build(cwd, None);
        let policy = Policy::default();

        let inputs = vec![cwd.join("a.txt"), subdir.clone()];
        let copied = build_workspace(&inputs, ws.path(), cwd, &matcher, &policy).expect("copy");
        assert_eq!(copied.len(), 2);
        assert!(ws.path().join("a.txt").is_file());
        assert!(ws.path().join("x").is_dir());
        assert!(ws.path().join("x").join("a.txt").is_file());
    }

    #[test]
    fn rejects_ignored_input() {
        let cwd = tempdir().expect("cwd");
        std::fs::create_dir(cwd.path().join(".git")).expect("mkdir");
        std::fs::write(cwd.path().join(".git").join("config"), b"x").expect("write");
        let ws = tempdir().expect("ws");
        let matcher = IgnoreMatcher::build(cwd.path(), None);
        let policy = Policy::default();
        let inputs = vec![cwd.path().join(".git")];
        let result = build_workspace(&inputs, ws.path(), cwd.path(), &matcher, &policy);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_outside_allowed_roots() {
        let cwd = tempdir().expect("cwd");
        let allowed_root = tempdir().expect("allowed");
        std::fs::write(cwd.path().join("a.txt"), b"A").expect("write");
        let ws = tempdir().expect("ws");
        let matcher = IgnoreMatcher::build(cwd.path(), None);
        let mut policy = Policy::default();
        policy.allowed_path_roots = vec![allowed_root.path().to_path_buf()];
        let inputs = vec![cwd.path().join("a.txt")];
        let result = build_workspace(&inputs, ws.path(), cwd.path(), &matcher, &policy);
        assert!(result.is_err());
    }
}
