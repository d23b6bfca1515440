//! Unpacking uploaded extension archives.

use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::error::ApiError;

/// Look up the uid/gid of the configured extension owner. Returns `None`
/// (and only logs) when no owner is configured, the user is unknown, or we
/// are not privileged enough to chown anyway.
pub fn resolve_owner(name: &str) -> Option<(Uid, Gid)> {
    if name.is_empty() {
        return None;
    }
    if !Uid::effective().is_root() {
        tracing::debug!(user = %name, "Not running as root; keeping extension ownership");
        return None;
    }
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Some((user.uid, user.gid)),
        Ok(None) => {
            tracing::warn!(user = %name, "Extension owner user does not exist");
            None
        }
        Err(e) => {
            tracing::warn!(user = %name, error = %e, "Failed to resolve extension owner");
            None
        }
    }
}

/// Extract `zip_path` into `<extensions_root>/<name>` and hand ownership to
/// `owner`. Entries that are absolute or escape the destination fail the
/// whole install.
pub fn install(
    extensions_root: &Path,
    name: &str,
    zip_path: &Path,
    owner: Option<(Uid, Gid)>,
) -> Result<PathBuf, ApiError> {
    let dest = extensions_root.join(name);
    std::fs::create_dir_all(&dest)
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("creating extension dir")))?;

    let file = std::fs::File::open(zip_path)
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("opening uploaded zip")))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ApiError::BadZip(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ApiError::BadZip(e.to_string()))?;

        // enclosed_name() normalizes and rejects absolute paths and any
        // `..` component that would climb out of the destination.
        let Some(relative) = entry.enclosed_name() else {
            return Err(ApiError::BadZip(format!(
                "entry {:?} escapes the extension directory",
                entry.name()
            )));
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| {
                ApiError::Internal(anyhow::Error::new(e).context("creating extension subdir"))
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ApiError::Internal(anyhow::Error::new(e).context("creating extension subdir"))
            })?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(|e| {
            ApiError::Internal(anyhow::Error::new(e).context("creating extension file"))
        })?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| ApiError::BadZip(format!("extracting {:?}: {e}", entry.name())))?;
    }

    if let Some((uid, gid)) = owner {
        chown_recursive(&dest, uid, gid)?;
    }

    tracing::info!(name = %name, dest = %dest.display(), "Extension installed");
    Ok(dest)
}

fn chown_recursive(path: &Path, uid: Uid, gid: Gid) -> Result<(), ApiError> {
    nix::unistd::chown(path, Some(uid), Some(gid))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("chown {}: {e}", path.display())))?;

    if path.is_dir() {
        let entries = std::fs::read_dir(path)
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("walking extension dir")))?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                ApiError::Internal(anyhow::Error::new(e).context("walking extension dir"))
            })?;
            chown_recursive(&entry.path(), uid, gid)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[test]
    fn test_install_unpacks_into_named_directory() {
        let root = tempfile::tempdir().unwrap();
        let zip = write_zip(&[
            ("manifest.json", br#"{"manifest_version":3}"#),
            ("scripts/background.js", b"console.log('hi')"),
        ]);

        let dest = install(root.path(), "ext1", zip.path(), None).unwrap();

        assert_eq!(dest, root.path().join("ext1"));
        assert!(dest.join("manifest.json").exists());
        assert!(dest.join("scripts/background.js").exists());
    }

    #[test]
    fn test_install_rejects_parent_escaping_entries() {
        let root = tempfile::tempdir().unwrap();
        let zip = write_zip(&[("../evil.js", b"boom")]);

        let err = install(root.path(), "ext1", zip.path(), None).unwrap_err();
        assert!(matches!(err, ApiError::BadZip(_)));
        assert!(!root.path().parent().unwrap().join("evil.js").exists());
    }

    #[test]
    fn test_install_rejects_garbage_archive() {
        let root = tempfile::tempdir().unwrap();
        let mut bogus = tempfile::NamedTempFile::new().unwrap();
        bogus.write_all(b"definitely not a zip").unwrap();

        let err = install(root.path(), "ext1", bogus.path(), None).unwrap_err();
        assert!(matches!(err, ApiError::BadZip(_)));
    }
}
