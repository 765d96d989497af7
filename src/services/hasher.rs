//! SHA-256 content hashing.

use crate::models::ContentHash;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 64 * 1024;

fn finish(hasher: Sha256) -> ContentHash {
    ContentHash::try_from(hex::encode(hasher.finalize()))
        .unwrap_or_else(|_| unreachable!("sha256 hex is always 64 lowercase chars"))
}

/// Hash an in-memory payload.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    finish(hasher)
}

/// Hash a reader to completion, returning the digest and the byte count.
pub async fn hash_reader<R>(mut reader: R) -> std::io::Result<(ContentHash, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((finish(hasher), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hash_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_bytes(b"hello").as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_reader_matches_bytes() {
        let data = vec![7u8; READ_CHUNK * 2 + 13];
        let (hash, size) = hash_reader(&data[..]).await.unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(hash, hash_bytes(&data));
    }
}
