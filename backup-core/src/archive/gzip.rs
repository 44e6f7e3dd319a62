//! Gzip handling for the engine's own formats: base tarballs and WAL segments.

use super::unpack_entries;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tar::{Archive, Builder};

/// Extract a `.tar.gz` produced by the engine into `target`.
pub fn extract_tar_gz(archive: &Path, target: &Path) -> Result<usize> {
    std::fs::create_dir_all(target)?;
    let file = File::open(archive).map_err(|e| {
        BackupError::Archive(format!("opening {}: {}", archive.display(), e))
    })?;
    unpack_entries(Archive::new(GzDecoder::new(BufReader::new(file))), archive, target)
}

/// Pack the regular files under `source` into a `.tar.gz`, skipping `exclude` names.
pub fn pack_tree_gz(source: &Path, archive: &Path, exclude: &[&str]) -> Result<usize> {
    let files = walk_files(source, &WalkOptions::excluding(exclude))?;
    let encoder = GzEncoder::new(BufWriter::new(File::create(archive)?), Compression::default());
    let mut builder = Builder::new(encoder);
    for file in &files {
        builder.append_path_with_name(&file.path, &file.relative_path)?;
    }
    builder.into_inner()?.finish()?.flush()?;
    Ok(files.len())
}

/// Gzip a single file (a WAL segment) to `dest`.
pub fn compress_file(src: &Path, dest: &Path) -> Result<u64> {
    let mut input = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    let copied = std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(copied)
}

/// Inverse of [`compress_file`].
pub fn decompress_file(src: &Path, dest: &Path) -> Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut output = BufWriter::new(File::create(dest)?);
    let copied = std::io::copy(&mut decoder, &mut output)
        .map_err(|e| BackupError::Archive(format!("decompressing {}: {}", src.display(), e)))?;
    output.flush()?;
    Ok(copied)
}
