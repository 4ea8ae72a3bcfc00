use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Hex SHA-256 and byte length of a file, streamed in chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Converts a hex digest into the base64 form S3 expects in checksum headers.
pub fn hex_to_base64(hex_digest: &str) -> Result<String, String> {
    let raw = hex::decode(hex_digest).map_err(|e| format!("invalid hex digest: {e}"))?;
    Ok(STANDARD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn digest_of_empty_input() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
        assert_eq!(
            hex_to_base64(EMPTY_SHA256).unwrap(),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[tokio::test]
    async fn file_digest_matches_in_memory_digest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let (digest, size) = sha256_file(&path).await.unwrap();
        assert_eq!(digest, sha256_hex(&content));
        assert_eq!(size, content.len() as u64);
    }

    #[test]
    fn rejects_non_hex_digest() {
        assert!(hex_to_base64("not-hex").is_err());
    }
}
