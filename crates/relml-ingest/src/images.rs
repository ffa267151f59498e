//! Image bundle entries (directory trees and zip archives) and lenient filename parsing.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;
use zip::ZipArchive;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilenameError {
    #[error("{0:?} has no file extension")]
    NoExtension(String),
    #[error("{name:?} has unsupported extension {extension:?}")]
    UnsupportedExtension { name: String, extension: String },
    #[error("{0:?} does not follow listing_sequence naming")]
    MissingSeparator(String),
    #[error("{0:?} has an empty listing number")]
    EmptyListingKey(String),
    #[error("{0:?} has no image sequence number")]
    MissingSequence(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub listing_key: String,
    pub sequence_number: u32,
    pub extension: String,
}

/// Parse `{listingNumber}_{imageNumber}.<ext>`. Directory prefixes, extension case and trailing
/// tokens after the sequence number (`_large`, `-1`, ` (1)`) are tolerated.
pub fn parse_image_filename(name: &str) -> Result<ImageName, FilenameError> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let Some((stem, extension)) = base.rsplit_once('.') else {
        return Err(FilenameError::NoExtension(name.to_string()));
    };
    let extension = extension.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return Err(FilenameError::UnsupportedExtension {
            name: name.to_string(),
            extension,
        });
    }
    let Some((listing_key, rest)) = stem.split_once('_') else {
        return Err(FilenameError::MissingSeparator(name.to_string()));
    };
    let listing_key = listing_key.trim();
    if listing_key.is_empty() {
        return Err(FilenameError::EmptyListingKey(name.to_string()));
    }
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let sequence_number = digits
        .parse::<u32>()
        .map_err(|_| FilenameError::MissingSequence(name.to_string()))?;
    Ok(ImageName {
        listing_key: listing_key.to_string(),
        sequence_number,
        extension,
    })
}

#[derive(Debug, Error)]
pub enum ImageSourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("reading archive member {name} of {path}: {message}")]
    Member {
        path: PathBuf,
        name: String,
        message: String,
    },
    #[error("{0} is neither a directory nor a zip archive")]
    Unsupported(PathBuf),
}

/// One image candidate. Read failures stay attached to the entry so the indexer can flag the
/// listing instead of aborting the batch.
#[derive(Debug)]
pub struct ImageEntry {
    /// File name as found (archive member name or path relative to the bundle root).
    pub name: String,
    /// Bundle location the entry came from.
    pub origin: PathBuf,
    pub data: Result<Vec<u8>, ImageSourceError>,
}

enum Pending {
    File { path: PathBuf, name: String },
    Archive(PathBuf),
}

struct OpenArchive {
    path: PathBuf,
    archive: ZipArchive<File>,
    next_index: usize,
}

/// Lazy entry stream over a directory tree (zip archives inside it are expanded) or over a
/// single zip archive. Bytes are read one entry at a time.
pub struct ImageBundle {
    pending: std::vec::IntoIter<Pending>,
    current: Option<OpenArchive>,
}

impl ImageBundle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageSourceError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|source| ImageSourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut pending = Vec::new();
        if metadata.is_dir() {
            collect_dir(path, &mut pending)?;
        } else if is_zip(path) {
            pending.push(Pending::Archive(path.to_path_buf()));
        } else {
            return Err(ImageSourceError::Unsupported(path.to_path_buf()));
        }
        Ok(Self {
            pending: pending.into_iter(),
            current: None,
        })
    }

    fn next_from_archive(&mut self) -> Option<ImageEntry> {
        let open = self.current.as_mut()?;
        while open.next_index < open.archive.len() {
            let index = open.next_index;
            open.next_index += 1;
            let mut member = match open.archive.by_index(index) {
                Ok(member) => member,
                Err(err) => {
                    return Some(ImageEntry {
                        name: format!("#{index}"),
                        origin: open.path.clone(),
                        data: Err(ImageSourceError::Member {
                            path: open.path.clone(),
                            name: format!("#{index}"),
                            message: err.to_string(),
                        }),
                    })
                }
            };
            let name = member.name().to_string();
            if member.is_dir() || is_hidden(&name) {
                continue;
            }
            let mut bytes = Vec::with_capacity(usize::try_from(member.size()).unwrap_or(0));
            let data = member
                .read_to_end(&mut bytes)
                .map(|_| bytes)
                .map_err(|err| ImageSourceError::Member {
                    path: open.path.clone(),
                    name: name.clone(),
                    message: err.to_string(),
                });
            return Some(ImageEntry {
                name,
                origin: open.path.clone(),
                data,
            });
        }
        self.current = None;
        None
    }
}

impl Iterator for ImageBundle {
    type Item = ImageEntry;

    fn next(&mut self) -> Option<ImageEntry> {
        loop {
            if self.current.is_some() {
                if let Some(entry) = self.next_from_archive() {
                    return Some(entry);
                }
                continue;
            }
            match self.pending.next()? {
                Pending::File { path, name } => {
                    let data = fs::read(&path).map_err(|source| ImageSourceError::Io {
                        path: path.clone(),
                        source,
                    });
                    return Some(ImageEntry {
                        name,
                        origin: path,
                        data,
                    });
                }
                Pending::Archive(path) => {
                    match File::open(&path)
                        .map_err(zip::result::ZipError::Io)
                        .and_then(ZipArchive::new)
                    {
                        Ok(archive) => {
                            self.current = Some(OpenArchive {
                                path,
                                archive,
                                next_index: 0,
                            });
                        }
                        Err(source) => {
                            warn!(
                                archive = %path.display(),
                                error = %source,
                                "skipping unreadable archive"
                            );
                            let name = path
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            return Some(ImageEntry {
                                name,
                                origin: path.clone(),
                                data: Err(ImageSourceError::Archive { path, source }),
                            });
                        }
                    }
                }
            }
        }
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with("__MACOSX")
        || name
            .rsplit('/')
            .next()
            .map(|base| base.starts_with('.'))
            .unwrap_or(false)
}

/// Depth-first, sorted by file name for deterministic batches. Symlinks are not followed.
fn collect_dir(root: &Path, out: &mut Vec<Pending>) -> Result<(), ImageSourceError> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !is_hidden(&entry.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = entry.map_err(|err| ImageSourceError::Io {
            path: err.path().unwrap_or(root).to_path_buf(),
            source: err.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if is_zip(&path) {
            out.push(Pending::Archive(path));
        } else {
            let name = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push(Pending::File { path, name });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    #[test]
    fn filenames_parse_leniently() {
        let parsed = parse_image_filename("HAR123_4.JPG").unwrap();
        assert_eq!(parsed.listing_key, "HAR123");
        assert_eq!(parsed.sequence_number, 4);
        assert_eq!(parsed.extension, "jpg");

        for name in [
            "photos/2024/HAR123_4_large.jpeg",
            "HAR123_4-1.png",
            "HAR123_4 (1).webp",
            r"C:\dump\HAR123_4.gif",
        ] {
            let parsed = parse_image_filename(name).unwrap();
            assert_eq!(parsed.listing_key, "HAR123", "{name}");
            assert_eq!(parsed.sequence_number, 4, "{name}");
        }
    }

    #[test]
    fn unparseable_filenames_are_rejected() {
        assert!(matches!(
            parse_image_filename("README"),
            Err(FilenameError::NoExtension(_))
        ));
        assert!(matches!(
            parse_image_filename("HAR123_1.tiff"),
            Err(FilenameError::UnsupportedExtension { .. })
        ));
        assert!(matches!(
            parse_image_filename("HAR123.jpg"),
            Err(FilenameError::MissingSeparator(_))
        ));
        assert!(matches!(
            parse_image_filename("_1.jpg"),
            Err(FilenameError::EmptyListingKey(_))
        ));
        assert!(matches!(
            parse_image_filename("HAR123_cover.jpg"),
            Err(FilenameError::MissingSequence(_))
        ));
    }

    #[test]
    fn directory_bundles_expand_nested_archives() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sale")).unwrap();
        std::fs::write(dir.path().join("sale/K1_1.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();

        let zip_path = dir.path().join("sale/batch.zip");
        let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer.add_directory("nested/", options).unwrap();
        writer.start_file("nested/K2_1.jpg", options).unwrap();
        writer.write_all(b"two").unwrap();
        writer.start_file("__MACOSX/._K2_1.jpg", options).unwrap();
        writer.write_all(b"meta").unwrap();
        writer.finish().unwrap();

        let entries: Vec<_> = ImageBundle::open(dir.path()).unwrap().collect();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sale/K1_1.jpg", "nested/K2_1.jpg"]);
        assert_eq!(entries[0].data.as_deref().unwrap(), b"one");
        assert_eq!(entries[1].data.as_deref().unwrap(), b"two");
        assert_eq!(entries[1].origin, zip_path);
    }

    #[test]
    fn corrupt_archives_surface_as_entry_errors() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broken.zip"), b"not a zip").unwrap();
        std::fs::write(dir.path().join("K1_1.jpg"), b"one").unwrap();

        let entries: Vec<_> = ImageBundle::open(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].data.is_ok());
        assert_eq!(entries[1].name, "broken.zip");
        assert!(matches!(
            entries[1].data,
            Err(ImageSourceError::Archive { .. })
        ));
    }

    #[test]
    fn plain_files_are_not_bundles() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            ImageBundle::open(&path),
            Err(ImageSourceError::Unsupported(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_walked() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("rental/inner")).unwrap();
        std::fs::write(dir.path().join("rental/inner/R1_1.jpg"), b"one").unwrap();
        std::os::unix::fs::symlink(dir.path().join("rental"), dir.path().join("rental/inner/up"))
            .unwrap();

        let entries: Vec<_> = ImageBundle::open(dir.path().join("rental")).unwrap().collect();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["inner/R1_1.jpg"]);
    }
}
