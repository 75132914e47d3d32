use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Computes a deterministic SHA-256 checksum over the files of a data part
/// directory, together with the total byte size of those files.
///
/// Files are hashed in sorted relative-path order and each file's relative
/// path is mixed into the digest, so renames change the checksum as well as
/// content edits. Two part directories with identical file sets hash
/// identically regardless of where they live on disk.
pub fn hash_part_dir(dir: &Path) -> io::Result<(String, u64)> {
    let mut files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut hasher = Sha256::new();
    let mut total_bytes: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];

    for path in files {
        let rel = path
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let mut file = File::open(&path)?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total_bytes += n as u64;
        }
    }

    Ok((hex::encode(hasher.finalize()), total_bytes))
}
