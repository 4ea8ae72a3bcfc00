// dbbackup/src/backup/archive.rs
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::CompressionConfig;
use crate::errors::BackupError;

/// A dump ready for upload: the file, its size and its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub compressed: bool,
}

impl PackagedArtifact {
    pub fn extension(&self) -> &'static str {
        payload_extension(self.compressed)
    }
}

pub fn payload_extension(compressed: bool) -> &'static str {
    if compressed { ".dump.gz" } else { ".dump" }
}

/// Forwards writes to `inner` while hashing and counting them.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compresses `dump_path` into `out_dir` (when enabled) and digests the
/// result. Blocking; run it on the blocking pool.
pub fn package_dump(
    dump_path: &Path,
    out_dir: &Path,
    compression: CompressionConfig,
) -> Result<PackagedArtifact, BackupError> {
    let package_err = |what: &str, e: io::Error| BackupError::Package(format!("{} failed: {}", what, e));

    let mut input = BufReader::new(File::open(dump_path).map_err(|e| package_err("opening dump", e))?);

    if !compression.enabled {
        let mut sink = HashingWriter::new(io::sink());
        io::copy(&mut input, &mut sink).map_err(|e| package_err("hashing dump", e))?;
        let (_, sha256, size) = sink.finish();
        return Ok(PackagedArtifact {
            path: dump_path.to_path_buf(),
            size,
            sha256,
            compressed: false,
        });
    }

    let file_name = dump_path
        .file_name()
        .map(|n| format!("{}.gz", n.to_string_lossy()))
        .unwrap_or_else(|| "payload.dump.gz".to_string());
    let out_path = out_dir.join(file_name);
    let out_file = File::create(&out_path).map_err(|e| package_err("creating package", e))?;

    let mut encoder = GzEncoder::new(
        HashingWriter::new(BufWriter::new(out_file)),
        Compression::new(compression.level),
    );
    io::copy(&mut input, &mut encoder).map_err(|e| package_err("compressing dump", e))?;
    let hashing = encoder.finish().map_err(|e| package_err("finishing gzip stream", e))?;
    let (mut writer, sha256, size) = hashing.finish();
    writer.flush().map_err(|e| package_err("flushing package", e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| package_err("syncing package", e))?;

    Ok(PackagedArtifact {
        path: out_path,
        size,
        sha256,
        compressed: true,
    })
}

/// Turns a downloaded payload back into a plain dump file.
/// Uncompressed payloads are returned as they are.
pub fn unpack_payload(payload_path: &Path, compressed: bool, dest: &Path) -> Result<PathBuf, BackupError> {
    if !compressed {
        return Ok(payload_path.to_path_buf());
    }
    let input = File::open(payload_path)
        .map_err(|e| BackupError::Package(format!("opening payload {}: {}", payload_path.display(), e)))?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut output = BufWriter::new(
        File::create(dest).map_err(|e| BackupError::Package(format!("creating {}: {}", dest.display(), e)))?,
    );
    io::copy(&mut decoder, &mut output)
        .map_err(|e| BackupError::Package(format!("decompressing {}: {}", payload_path.display(), e)))?;
    output
        .flush()
        .map_err(|e| BackupError::Package(format!("writing {}: {}", dest.display(), e)))?;
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::checksum::sha256_file;
    use tempfile::TempDir;

    fn dump_file(dir: &Path) -> (PathBuf, Vec<u8>) {
        let content: Vec<u8> = b"PGDMP fake custom archive "
            .iter()
            .cycle()
            .take(100_000)
            .copied()
            .collect();
        let path = dir.join("main.dump");
        std::fs::write(&path, &content).unwrap();
        (path, content)
    }

    #[tokio::test]
    async fn compressed_package_digest_matches_the_file_on_disk() {
        let dir = TempDir::new().unwrap();
        let (dump, content) = dump_file(dir.path());

        let packaged = package_dump(
            &dump,
            dir.path(),
            CompressionConfig {
                enabled: true,
                level: 6,
            },
        )
        .unwrap();
        assert!(packaged.compressed);
        assert_eq!(packaged.extension(), ".dump.gz");
        assert!(packaged.size < content.len() as u64);

        let (on_disk, size) = sha256_file(&packaged.path).await.unwrap();
        assert_eq!(on_disk, packaged.sha256);
        assert_eq!(size, packaged.size);

        let restored = unpack_payload(&packaged.path, true, &dir.path().join("restored.dump")).unwrap();
        assert_eq!(std::fs::read(restored).unwrap(), content);
    }

    #[tokio::test]
    async fn uncompressed_package_is_the_dump_itself() {
        let dir = TempDir::new().unwrap();
        let (dump, content) = dump_file(dir.path());

        let packaged = package_dump(
            &dump,
            dir.path(),
            CompressionConfig {
                enabled: false,
                level: 6,
            },
        )
        .unwrap();
        assert_eq!(packaged.path, dump);
        assert_eq!(packaged.size, content.len() as u64);
        assert_eq!(packaged.sha256, crate::utils::checksum::sha256_hex(&content));
        assert_eq!(unpack_payload(&dump, false, Path::new("/unused")).unwrap(), dump);
    }

    #[test]
    fn missing_dump_is_a_package_error() {
        let dir = TempDir::new().unwrap();
        let err = package_dump(
            &dir.path().join("absent.dump"),
            dir.path(),
            CompressionConfig {
                enabled: true,
                level: 6,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "PackageError");
    }
}
