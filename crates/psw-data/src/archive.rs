//! Gzipped tarball extraction for the dataset archives.

use std::io::Read;
use std::path::Path;

use tracing::warn;

use crate::DataError;

/// Unpacks every entry of a tar stream under `dest`, returning how many
/// regular files were written. Entries whose path would escape `dest` are
/// skipped.
pub fn unpack<R: Read>(reader: R, dest: &Path) -> Result<usize, DataError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let mut files = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_file = entry.header().entry_type().is_file();
        let path = entry.path()?.into_owned();
        if !entry.unpack_in(dest)? {
            warn!(entry = %path.display(), "skipping tar entry outside destination");
            continue;
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

/// [`unpack`] over a gzip-compressed archive file.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<usize, DataError> {
    let f = std::fs::File::open(archive)?;
    let gz = flate2::read::GzDecoder::new(std::io::BufReader::new(f));
    unpack(gz, dest).map_err(|e| match e {
        DataError::Io(io) => DataError::Tar(format!("{}: {io}", archive.display())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "psw-tar-{name}-{}-{}",
            std::process::id(),
            psw_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn gnu_entry(builder: &mut tar::Builder<impl Write>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, data).unwrap();
    }

    #[test]
    fn unpacks_gnu_long_names_from_gzip() {
        let dir = temp_dir("gnu");
        let long = format!("cifar-10-batches-bin/{}/data_batch_1.bin", "nested".repeat(20));
        assert!(long.len() > 100);

        let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(gz);
        gnu_entry(&mut builder, &long, b"abc");
        gnu_entry(&mut builder, "cifar-10-batches-bin/batches.meta.txt", b"airplane\n");
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let archive = dir.join("cifar.tar.gz");
        std::fs::write(&archive, bytes).unwrap();
        let out = dir.join("out");
        assert_eq!(unpack_tar_gz(&archive, &out).unwrap(), 2);
        assert_eq!(std::fs::read(out.join(&long)).unwrap(), b"abc");
        assert_eq!(
            std::fs::read(out.join("cifar-10-batches-bin/batches.meta.txt")).unwrap(),
            b"airplane\n"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn directories_are_not_counted() {
        let dir = temp_dir("dirs");
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "batches/", std::io::empty())
            .unwrap();
        gnu_entry(&mut builder, "batches/test_batch.bin", &[7u8; 16]);
        let bytes = builder.into_inner().unwrap();

        assert_eq!(unpack(bytes.as_slice(), &dir).unwrap(), 1);
        assert!(dir.join("batches").is_dir());
        assert_eq!(std::fs::read(dir.join("batches/test_batch.bin")).unwrap(), vec![7u8; 16]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
