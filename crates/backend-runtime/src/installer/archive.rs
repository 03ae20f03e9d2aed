//! Archive extraction for downloaded release artifacts

use std::fs::File;
use std::path::Path;

use crate::error::{BackendError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest`, which must already exist
pub fn extract(archive: &Path, filename: &str, dest: &Path) -> Result<()> {
    let kind = ArchiveKind::from_filename(filename)
        .ok_or_else(|| BackendError::Install(format!("Unsupported archive format: {}", filename)))?;

    log::info!("Extracting {} to {:?}", filename, dest);

    let file = File::open(archive)
        .map_err(|e| BackendError::Install(format!("Failed to open archive: {}", e)))?;

    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| BackendError::Install(format!("Failed to read zip archive: {}", e)))?;
            zip.extract(dest)
                .map_err(|e| BackendError::Install(format!("Failed to extract zip archive: {}", e)))?;
        }
        ArchiveKind::TarGz => {
            let decoder = flate2::read::GzDecoder::new(file);
            let mut tar = tar::Archive::new(decoder);
            tar.unpack(dest)
                .map_err(|e| BackendError::Install(format!("Failed to extract tar archive: {}", e)))?;
        }
    }

    Ok(())
}

/// Make a file executable on Unix; no-op elsewhere
pub fn mark_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Depth-first search for a file named `name` under `dir`
pub fn find_file(dir: &Path, name: &str) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if entry.file_name().to_string_lossy() == name {
            return Some(path);
        }
    }

    subdirs.sort();
    subdirs.iter().find_map(|sub| find_file(sub, name))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_kind() {
        assert_eq!(ArchiveKind::from_filename("llama-b1-bin-ubuntu-x64.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_filename("koko.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_filename("flm-setup.exe"), None);
    }

    #[test]
    fn test_extract_zip_and_find_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("a.zip");
        std::fs::write(
            &archive,
            fixtures::zip_bytes(&[("build/bin/llama-server", b"#!/bin/sh\n"), ("README.md", b"hi")]),
        )
        .unwrap();

        let dest = tmp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        extract(&archive, "a.zip", &dest).unwrap();

        let found = find_file(&dest, "llama-server").unwrap();
        assert!(found.ends_with("build/bin/llama-server"));
        assert!(find_file(&dest, "missing").is_none());
    }

    #[test]
    fn test_extract_tar_gz() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("k.tar.gz");
        std::fs::write(&archive, fixtures::tar_gz_bytes(&[("kokoros/koko", b"bin")])).unwrap();

        let dest = tmp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        extract(&archive, "k.tar.gz", &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("kokoros/koko")).unwrap(), b"bin");
    }

    #[test]
    fn test_corrupt_archive_is_install_error() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bad.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        let err = extract(&archive, "bad.zip", tmp.path()).unwrap_err();
        assert!(matches!(err, BackendError::Install(_)));
    }
}
