//! Dispatch archive extraction by file extension, and copy the single entry
//! matching a shell-style glob out of the archive into a destination writer.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::ArchiveError;

/// The archive formats the pipeline knows how to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    TarPlain,
    TarGz,
    TarBz2,
    TarXz,
    TarLz4,
    TarSz,
    Rar,
}

impl Format {
    /// Recognize a format from a file name by its (possibly compound) extension.
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();

        Some(if name.ends_with(".zip") {
            Format::Zip
        } else if name.ends_with(".tar") {
            Format::TarPlain
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Format::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Format::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Format::TarXz
        } else if name.ends_with(".tar.lz4") || name.ends_with(".tlz4") {
            Format::TarLz4
        } else if name.ends_with(".tar.sz") || name.ends_with(".tsz") {
            Format::TarSz
        } else if name.ends_with(".rar") {
            Format::Rar
        } else {
            return None;
        })
    }
}

/// Whether `path` looks like a supported archive. Used by the artifact pipeline
/// to decide whether extraction applies at all.
pub fn is_supported(path: &Path) -> bool {
    Format::detect(path).is_some()
}

/// Walk the archive at `archive_path`, find the first non-directory entry whose
/// base name matches `pattern` (a shell-style glob), and copy its bytes into
/// `dest`. Returns [`ArchiveError::NoMatch`] if nothing matches.
pub fn extract_matching(
    archive_path: &Path,
    pattern: &str,
    dest: &mut impl io::Write,
) -> Result<(), ArchiveError> {
    let format =
        Format::detect(archive_path).ok_or_else(|| ArchiveError::UnknownFormat(archive_path.to_owned()))?;

    let glob_pattern =
        glob::Pattern::new(pattern).map_err(|e| ArchiveError::BadPattern(pattern.to_owned(), e))?;

    match format {
        Format::Zip => extract_from_zip(archive_path, &glob_pattern, dest),
        Format::Rar => extract_from_rar(archive_path, &glob_pattern, dest),
        _ => {
            let file = File::open(archive_path).map_err(|e| ArchiveError::Open(archive_path.to_owned(), e))?;
            let decoder: Box<dyn Read> = match format {
                Format::TarPlain => Box::new(file),
                Format::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
                Format::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
                Format::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
                Format::TarLz4 => Box::new(lz4_flex::frame::FrameDecoder::new(file)),
                Format::TarSz => Box::new(snap::read::FrameDecoder::new(file)),
                Format::Zip | Format::Rar => unreachable!(),
            };
            extract_from_tar(decoder, &glob_pattern, dest)
        }
    }
}

fn base_name_matches(entry_path: &Path, pattern: &glob::Pattern) -> bool {
    entry_path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| pattern.matches(name))
}

fn extract_from_tar(
    reader: impl Read,
    pattern: &glob::Pattern,
    dest: &mut impl io::Write,
) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::Open(Path::new("<tar stream>").to_owned(), e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Open(Path::new("<tar stream>").to_owned(), e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| ArchiveError::Open(Path::new("<tar entry>").to_owned(), e))?
            .into_owned();

        if base_name_matches(&path, pattern) {
            io::copy(&mut entry, dest).map_err(|e| ArchiveError::Open(path, e))?;
            return Ok(());
        }
    }

    Err(ArchiveError::NoMatch(pattern.as_str().to_owned()))
}

fn extract_from_zip(
    archive_path: &Path,
    pattern: &glob::Pattern,
    dest: &mut impl io::Write,
) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(|e| ArchiveError::Open(archive_path.to_owned(), e))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| ArchiveError::Open(archive_path.to_owned(), io::Error::other(e)))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ArchiveError::Open(archive_path.to_owned(), io::Error::other(e)))?;

        if entry.is_dir() {
            continue;
        }

        let Some(name) = entry.enclosed_name() else {
            continue;
        };

        if base_name_matches(&name, pattern) {
            io::copy(&mut entry, dest).map_err(|e| ArchiveError::Open(name, e))?;
            return Ok(());
        }
    }

    Err(ArchiveError::NoMatch(pattern.as_str().to_owned()))
}

fn extract_from_rar(
    archive_path: &Path,
    pattern: &glob::Pattern,
    dest: &mut impl io::Write,
) -> Result<(), ArchiveError> {
    let archive = unrar::Archive::new(archive_path)
        .open_for_processing()
        .map_err(|e| ArchiveError::Open(archive_path.to_owned(), io::Error::other(e.to_string())))?;

    let mut cursor = Some(archive);
    while let Some(archive) = cursor.take() {
        let Some(header) = archive
            .read_header()
            .map_err(|e| ArchiveError::Open(archive_path.to_owned(), io::Error::other(e.to_string())))?
        else {
            break;
        };

        let entry_path = header.entry().filename.clone();
        let is_file = !header.entry().is_directory();

        if is_file && base_name_matches(&entry_path, pattern) {
            let (data, _) = header
                .read()
                .map_err(|e| ArchiveError::Open(archive_path.to_owned(), io::Error::other(e.to_string())))?;
            dest.write_all(&data).map_err(|e| ArchiveError::Open(entry_path, e))?;
            return Ok(());
        }

        cursor = Some(
            header
                .skip()
                .map_err(|e| ArchiveError::Open(archive_path.to_owned(), io::Error::other(e.to_string())))?,
        );
    }

    Err(ArchiveError::NoMatch(pattern.as_str().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_compound_extensions() {
        assert_eq!(Format::detect(Path::new("plugin.tar.gz")), Some(Format::TarGz));
        assert_eq!(Format::detect(Path::new("plugin.tgz")), Some(Format::TarGz));
        assert_eq!(Format::detect(Path::new("plugin.tar.bz2")), Some(Format::TarBz2));
        assert_eq!(Format::detect(Path::new("plugin.zip")), Some(Format::Zip));
        assert_eq!(Format::detect(Path::new("plugin.rar")), Some(Format::Rar));
        assert_eq!(Format::detect(Path::new("plugin.bin")), None);
    }

    #[test]
    fn is_supported_matches_detect() {
        assert!(is_supported(Path::new("plugin.tar.xz")));
        assert!(!is_supported(Path::new("plugin.exe")));
    }

    #[test]
    fn no_match_in_plain_tar() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("empty.tar");
        {
            let file = File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            builder.finish().unwrap();
        }

        let mut out = Vec::new();
        let err = extract_matching(&tar_path, "terraform-*", &mut out).unwrap_err();
        assert!(matches!(err, ArchiveError::NoMatch(_)));
        let _ = out.write_all(&[]);
    }

    #[test]
    fn extracts_matching_tar_entry() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("plugin.tar");
        {
            let file = File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let data = b"plugin binary contents";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, "terraform-provider-aws_v1.0.0", &data[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let mut out = Vec::new();
        extract_matching(&tar_path, "terraform-*", &mut out).unwrap();
        assert_eq!(out, b"plugin binary contents");
    }
}
