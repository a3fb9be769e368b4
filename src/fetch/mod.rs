//! Retrieval of feed and archive bytes from HTTP(S) URLs or local paths.

mod basic;
mod client;
mod headers;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use headers::WithHeaders;

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?)
}

pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Inflates `bytes` when they carry the gzip magic number, otherwise returns them as-is.
pub fn maybe_gunzip(bytes: Bytes) -> Result<Bytes> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(bytes);
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes.as_ref())
        .read_to_end(&mut out)
        .context("failed to inflate gzip payload")?;
    Ok(Bytes::from(out))
}

/// Loads a source from a URL (with the given extra headers) or a local file.
///
/// reqwest undoes any `Content-Encoding`; payloads that still start with the
/// gzip magic (a `.gz` file, local or served as-is) are inflated here.
#[tracing::instrument(skip(headers))]
pub async fn fetch_source(location: &str, headers: &BTreeMap<String, String>) -> Result<Bytes> {
    if is_remote(location) {
        let client = WithHeaders::new(BasicClient::new(), headers)?;
        let bytes = fetch_bytes(&client, location)
            .await
            .with_context(|| format!("failed to download {location}"))?;
        debug!(bytes = bytes.len(), "download complete");
        maybe_gunzip(bytes)
    } else {
        let bytes = tokio::fs::read(location)
            .await
            .with_context(|| format!("failed to read {location}"))?;
        maybe_gunzip(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_plain_bytes_pass_through() {
        let bytes = maybe_gunzip(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[test]
    fn test_gzip_bytes_are_inflated() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello feed").unwrap();
        let compressed = encoder.finish().unwrap();
        let bytes = maybe_gunzip(Bytes::from(compressed)).unwrap();
        assert_eq!(&bytes[..], b"hello feed");
    }

    #[test]
    fn test_truncated_gzip_is_an_error() {
        assert!(maybe_gunzip(Bytes::from_static(&[0x1f, 0x8b, 0x08])).is_err());
    }

    #[tokio::test]
    async fn test_reads_local_gzipped_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.pb.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[1, 2, 3]).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let bytes = fetch_source(path.to_str().unwrap(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_local_file_is_an_error() {
        assert!(fetch_source("/nonexistent/feed.pb", &BTreeMap::new()).await.is_err());
    }

    #[test]
    fn test_detects_remote_locations() {
        assert!(is_remote("https://example.org/feed"));
        assert!(!is_remote("./feed.pb"));
    }
}
