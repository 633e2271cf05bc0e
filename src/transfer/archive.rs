use std::{
    fs,
    io::{self, Read, Write},
    path::{Component, Path},
};

use tar::{Builder, EntryType, Header};

const TAR_BLOCK: u64 = 512;

struct FolderEntry {
    path: std::path::PathBuf,
    /// Forward-slash relative name; directories carry a trailing slash.
    name: String,
    metadata: fs::Metadata,
}

/// Deterministic pre-order walk shared by the sizer and the streamer, so the
/// advertised Content-Length is exactly what the stream produces.
fn walk_folder(src: &Path) -> io::Result<Vec<FolderEntry>> {
    let mut entries = Vec::new();
    walk_into(src, String::new(), &mut entries)?;
    Ok(entries)
}

fn walk_into(dir: &Path, prefix: String, out: &mut Vec<FolderEntry>) -> io::Result<()> {
    let mut children: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|entry| entry.file_name());
    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let metadata = child.metadata()?;
        let path = child.path();
        if metadata.is_dir() {
            out.push(FolderEntry {
                path: path.clone(),
                name: format!("{rel}/"),
                metadata,
            });
            walk_into(&path, rel, out)?;
        } else if metadata.is_file() {
            out.push(FolderEntry {
                path,
                name: rel,
                metadata,
            });
        }
        // symlinks and special files are not transferred
    }
    Ok(())
}

#[derive(Default)]
struct CountWriter {
    written: u64,
}

impl Write for CountWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Exact byte length of the archive `stream_folder_to_tar` will produce for
/// the same tree: headers are written into a counting sink, file contents are
/// accounted as whole 512-byte blocks, plus the two-block terminator.
pub fn calculate_tar_size(src: &Path) -> io::Result<i64> {
    let entries = walk_folder(src)?;
    let mut counter = CountWriter::default();
    let mut content_bytes: u64 = 0;
    {
        let mut builder = Builder::new(&mut counter);
        for entry in &entries {
            let mut header = Header::new_gnu();
            header.set_metadata(&entry.metadata);
            builder.append_data(&mut header, entry.name.trim_end_matches('/'), io::empty())?;
            if entry.metadata.is_file() {
                content_bytes += entry.metadata.len().div_ceil(TAR_BLOCK) * TAR_BLOCK;
            }
        }
        builder.finish()?;
    }
    Ok((counter.written + content_bytes) as i64)
}

/// Write the folder as a tar stream. Must stay entry-for-entry identical to
/// `calculate_tar_size` over the same tree.
pub fn stream_folder_to_tar<W: Write>(writer: W, src: &Path) -> io::Result<()> {
    let entries = walk_folder(src)?;
    let mut builder = Builder::new(writer);
    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_metadata(&entry.metadata);
        let name = entry.name.trim_end_matches('/').to_string();
        if entry.metadata.is_dir() {
            builder.append_data(&mut header, &name, io::empty())?;
        } else {
            let file = fs::File::open(&entry.path)?;
            builder.append_data(&mut header, &name, file)?;
        }
    }
    builder.finish()
}

/// Unpack a tar stream under `dest`. Entries that would escape the
/// destination are skipped silently; directory and file create failures are
/// logged and skipped; read and write errors abort so the caller can classify
/// them.
pub fn extract_tar<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if !is_clean_relative(&rel) {
            continue;
        }
        let target = dest.join(&rel);
        match entry.header().entry_type() {
            EntryType::Directory => {
                if let Err(err) = create_dir_all_0755(&target) {
                    log::error!("failed to create directory {}: {err}", target.display());
                }
            }
            EntryType::Regular => {
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut file = match open_with_mode(&target, mode) {
                    Ok(file) => file,
                    Err(err) => {
                        log::error!("failed to create file {}: {err}", target.display());
                        continue;
                    }
                };
                io::copy(&mut entry, &mut file)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_clean_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[cfg(unix)]
pub(crate) fn create_dir_all_0755(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

#[cfg(not(unix))]
pub(crate) fn create_dir_all_0755(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(path)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tree(entries: &[(&str, usize)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (rel, size) in entries {
            let path = tmp.path().join(rel);
            if rel.ends_with('/') {
                fs::create_dir_all(&path).unwrap();
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(&path, vec![0xAB; *size]).unwrap();
            }
        }
        tmp
    }

    #[test]
    fn sizer_matches_streamed_byte_count() {
        let trees: Vec<Vec<(&str, usize)>> = vec![
            vec![("a.txt", 100), ("sub/b.bin", 513)],
            vec![("empty.txt", 0), ("exact.bin", 512), ("deep/down/file", 1)],
            vec![("only-dirs/", 0), ("only-dirs/nested/", 0)],
        ];
        for tree in trees {
            let src = build_tree(&tree);
            let predicted = calculate_tar_size(src.path()).unwrap();
            let mut streamed = Vec::new();
            stream_folder_to_tar(&mut streamed, src.path()).unwrap();
            assert_eq!(predicted, streamed.len() as i64, "tree: {tree:?}");
        }
    }

    #[test]
    fn stream_extract_roundtrip_preserves_content() {
        let src = build_tree(&[("a.txt", 100), ("sub/b.bin", 513)]);
        let mut archive = Vec::new();
        stream_folder_to_tar(&mut archive, src.path()).unwrap();

        let dest = TempDir::new().unwrap();
        extract_tar(io::Cursor::new(archive), dest.path()).unwrap();

        assert_eq!(
            fs::read(dest.path().join("a.txt")).unwrap(),
            vec![0xAB; 100]
        );
        assert_eq!(
            fs::read(dest.path().join("sub/b.bin")).unwrap(),
            vec![0xAB; 513]
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let src = build_tree(&[("run.sh", 24)]);
        fs::set_permissions(
            src.path().join("run.sh"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let mut archive = Vec::new();
        stream_folder_to_tar(&mut archive, src.path()).unwrap();
        let dest = TempDir::new().unwrap();
        extract_tar(io::Cursor::new(archive), dest.path()).unwrap();

        let mode = fs::metadata(dest.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    fn raw_entry(name: &str, content: &[u8]) -> Vec<u8> {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        {
            // set_path refuses traversal components, so write the raw name
            // the way a hostile sender would
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
        }
        header.set_cksum();
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(content);
        let pad = (TAR_BLOCK as usize - content.len() % TAR_BLOCK as usize) % TAR_BLOCK as usize;
        out.resize(out.len() + pad, 0);
        out
    }

    #[test]
    fn traversal_entries_are_skipped_silently() {
        let mut archive = Vec::new();
        archive.extend(raw_entry("../evil.txt", b"pwned"));
        archive.extend(raw_entry("ok.txt", b"fine"));
        archive.extend([0u8; 1024]);

        let outer = TempDir::new().unwrap();
        let dest = outer.path().join("inbox");
        fs::create_dir_all(&dest).unwrap();

        extract_tar(io::Cursor::new(archive), &dest).unwrap();
        assert!(!outer.path().join("evil.txt").exists());
        assert_eq!(fs::read(dest.join("ok.txt")).unwrap(), b"fine");
    }
}
