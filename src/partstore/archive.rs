use std::fs::File;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;
use walkdir::WalkDir;

use crate::errors::{BackupError, Result};

/// Build a gzip-compressed tar archive of a part directory's contents.
/// Paths inside the archive are relative to `part_dir`, so the archive can
/// be unpacked under any destination part directory.
pub fn create_part_tarball(part_dir: &Path, tarball_path: &Path) -> Result<()> {
    if !part_dir.is_dir() {
        return Err(BackupError::InvalidInput(format!(
            "part source is not a directory: {}",
            part_dir.display()
        )));
    }

    let tarball = File::create(tarball_path)?;
    let enc = GzEncoder::new(tarball, Compression::default());
    let mut builder = Builder::new(enc);

    for entry in WalkDir::new(part_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BackupError::SourceRead(format!("walk {}: {e}", part_dir.display()))
        })?;
        let path = entry.path();
        let name = match path.strip_prefix(part_dir) {
            Ok(n) if !n.as_os_str().is_empty() => n,
            _ => continue,
        };
        if path.is_file() {
            builder.append_path_with_name(path, name)?;
        }
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// Unpack a part tarball into the given part directory.
pub fn extract_part_tarball(tarball_path: &Path, part_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(part_dir)?;
    let tarball = File::open(tarball_path)?;
    let decoder = flate2::read::GzDecoder::new(tarball);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(part_dir)?;
    Ok(())
}
