use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use shared::{Digest, Digester};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::errors::Result;

/// Scratch directory for packed archives under the push/pull base.
pub static MODELX_CACHE_DIR: &str = ".modelx";

/// Pack `dir` into gzip-of-tar, streaming the archive bytes into
/// `into_file` (when given) and a digester at the same time. Entry order
/// is sorted and mtimes are cleared, so equal trees produce equal digests.
pub async fn tgz(dir: &Path, into_file: Option<&Path>) -> Result<(Digest, i64)> {
    let dir = dir.to_path_buf();
    let into_file = into_file.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || tgz_sync(&dir, into_file.as_deref())).await?
}

pub fn tgz_sync(dir: &Path, into_file: Option<&Path>) -> Result<(Digest, i64)> {
    let mut entries = Vec::new();
    collect_entries(dir, &PathBuf::new(), &mut entries)?;
    entries.sort();

    let file = match into_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Some(std::fs::File::create(path)?)
        }
        None => None,
    };
    let mut tee = DigestWriter {
        file,
        digester: Digester::new(),
        written: 0,
    };

    {
        let encoder = GzEncoder::new(&mut tee, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for relative in &entries {
            let full = dir.join(relative);
            let metadata = std::fs::metadata(&full)?;
            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(permissions_mode(&metadata));
            if metadata.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                let name = format!("{}/", relative.display());
                builder.append_data(&mut header, name, std::io::empty())?;
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(metadata.len());
                builder.append_data(&mut header, relative, std::fs::File::open(&full)?)?;
            }
        }
        builder.into_inner()?.finish()?;
    }

    Ok((tee.digester.finalize(), tee.written as i64))
}

fn collect_entries(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        out.push(child.clone());
        if entry.file_type()?.is_dir() {
            collect_entries(root, &child, out)?;
        }
    }
    Ok(())
}

/// Extract a gzip-of-tar stream into `dir`, applying the archive's
/// embedded modes.
pub fn untgz_sync<R: std::io::Read>(reader: R, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.unpack(dir)?;
    Ok(())
}

pub async fn untgz_file(archive: &Path, dir: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        untgz_sync(file, &dir)
    })
    .await?
}

/// Streaming sha256 of a file's bytes.
pub async fn digest_file(path: &Path) -> Result<(Digest, i64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digester = Digester::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0i64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        total += n as i64;
    }
    Ok((digester.finalize(), total))
}

pub fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if metadata.is_dir() {
            0o755
        } else {
            0o644
        }
    }
}

struct DigestWriter {
    file: Option<std::fs::File>,
    digester: Digester,
    written: u64,
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        self.digester.update(buf);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("vocab")).unwrap();
        std::fs::write(dir.join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.join("vocab/words.txt"), b"beta").unwrap();
        std::fs::write(dir.join("empty"), b"").unwrap();
    }

    #[tokio::test]
    async fn test_tgz_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        let (first, size_first) = tgz(dir.path(), None).await.unwrap();
        let (second, size_second) = tgz(dir.path(), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(size_first, size_second);
        assert!(size_first > 0);
    }

    #[tokio::test]
    async fn test_tgz_digest_matches_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("cache/tree.tar.gz");
        let (digest, size) = tgz(dir.path(), Some(&archive)).await.unwrap();

        let (file_digest, file_size) = digest_file(&archive).await.unwrap();
        assert_eq!(digest, file_digest);
        assert_eq!(size, file_size);
    }

    #[tokio::test]
    async fn test_tgz_untgz_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("tree.tar.gz");
        tgz(dir.path(), Some(&archive)).await.unwrap();

        let extracted = out.path().join("extracted");
        untgz_file(&archive, &extracted).await.unwrap();
        assert_eq!(
            std::fs::read(extracted.join("a.txt")).unwrap(),
            b"alpha"
        );
        assert_eq!(
            std::fs::read(extracted.join("vocab/words.txt")).unwrap(),
            b"beta"
        );
        assert_eq!(std::fs::read(extracted.join("empty")).unwrap(), b"");

        // the extracted tree packs back to the same digest
        let (original, _) = tgz(dir.path(), None).await.unwrap();
        let (roundtrip, _) = tgz(&extracted, None).await.unwrap();
        assert_eq!(original, roundtrip);
    }

    #[tokio::test]
    async fn test_digest_file_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let (digest, size) = digest_file(&path).await.unwrap();
        assert_eq!(digest.as_str(), shared::EMPTY_FILE_DIGEST);
        assert_eq!(size, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tgz_preserves_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("tree.tar.gz");
        tgz(dir.path(), Some(&archive)).await.unwrap();
        let extracted = out.path().join("x");
        untgz_file(&archive, &extracted).await.unwrap();

        let mode = std::fs::metadata(extracted.join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
