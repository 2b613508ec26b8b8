//! Checkpoint archive packing and extraction.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Archive formats a checkpoint may be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from the file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest`, returning the number of files written.
///
/// Entries that would escape `dest` are skipped.
pub fn extract(archive: &Path, dest: &Path) -> io::Result<usize> {
    let format = ArchiveFormat::detect(archive).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported archive: {}", archive.display()),
        )
    })?;
    std::fs::create_dir_all(dest)?;
    match format {
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
        ArchiveFormat::Zip => extract_zip(archive, dest),
    }
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> io::Result<usize> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut extracted = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let is_file = entry.header().entry_type().is_file();
        if entry.unpack_in(dest)? {
            if is_file {
                extracted += 1;
            }
        } else {
            tracing::warn!(
                archive = %archive.display(),
                entry = %entry.path().map(|p| p.display().to_string()).unwrap_or_default(),
                "Skipped archive entry outside destination"
            );
        }
    }
    Ok(extracted)
}

fn extract_zip(archive: &Path, dest: &Path) -> io::Result<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(io::Error::other)?;
    let mut extracted = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(io::Error::other)?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(
                archive = %archive.display(),
                entry = entry.name(),
                "Skipped archive entry outside destination"
            );
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }
    Ok(extracted)
}

/// Hex SHA-256 of the archive bytes. Identifies the archive an extraction came from.
pub fn content_hash(archive: &Path) -> io::Result<String> {
    let mut file = File::open(archive)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Pack the contents of `source_dir` into a gzip-compressed tarball at `dest`.
pub fn pack_tar_gz(source_dir: &Path, dest: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(enc);
    tar.append_dir_all(".", source_dir)?;
    tar.into_inner()?.finish()?;
    Ok(dest.to_path_buf())
}

/// Pack the regular files under `source_dir` into a deflated zip at `dest`.
pub fn pack_zip(source_dir: &Path, dest: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in walkdir::WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");
        let mut buf = Vec::new();
        File::open(entry.path())?.read_to_end(&mut buf)?;
        zip.start_file(name, options).map_err(io::Error::other)?;
        zip.write_all(&buf)?;
    }
    zip.finish().map_err(io::Error::other)?;
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(dir: &Path) -> PathBuf {
        let src = dir.join("checkpoint");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("config.json"), b"{}").unwrap();
        std::fs::write(src.join("sub").join("model.safetensors"), b"weights").unwrap();
        src
    }

    #[test]
    fn test_detect() {
        assert_eq!(
            ArchiveFormat::detect(Path::new("a/checkpoint.tar.gz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("checkpoint.TGZ")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("checkpoint.zip")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(ArchiveFormat::detect(Path::new("checkpoint.tar")), None);
    }

    #[test]
    fn test_tar_gz_pack_and_extract() {
        let dir = TempDir::new().unwrap();
        let src = checkpoint(dir.path());
        let archive = pack_tar_gz(&src, &dir.path().join("checkpoint.tar.gz")).unwrap();
        let out = dir.path().join("out");
        let count = extract(&archive, &out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read(out.join("sub").join("model.safetensors")).unwrap(),
            b"weights"
        );
    }

    #[test]
    fn test_zip_pack_and_extract() {
        let dir = TempDir::new().unwrap();
        let src = checkpoint(dir.path());
        let archive = pack_zip(&src, &dir.path().join("checkpoint.zip")).unwrap();
        let out = dir.path().join("out");
        assert_eq!(extract(&archive, &out).unwrap(), 2);
        assert!(out.join("config.json").is_file());
    }

    #[test]
    fn test_content_hash_follows_bytes() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tar.gz");
        let b = dir.path().join("b.tar.gz");
        std::fs::write(&a, b"same").unwrap();
        std::fs::write(&b, b"same").unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        std::fs::write(&b, b"changed").unwrap();
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_eq!(content_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("checkpoint.tar.gz");
        std::fs::write(&archive, b"not a tarball").unwrap();
        assert!(extract(&archive, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_zip_skips_traversal_entries() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("../escape.txt", options).unwrap();
            zip.write_all(b"x").unwrap();
            zip.start_file("ok.txt", options).unwrap();
            zip.write_all(b"y").unwrap();
            zip.finish().unwrap();
        }
        let out = dir.path().join("out");
        assert_eq!(extract(&archive, &out).unwrap(), 1);
        assert!(!dir.path().join("escape.txt").exists());
    }
}
