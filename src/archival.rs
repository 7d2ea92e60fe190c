// RequestArchival — gzip-compressed copies of raw inbound request bodies,
// laid out as `data/requests/<client_addr>/<YYYY-MM-DD>/<ts>_<uuid>.json.gz`.
// Failures here are logged and swallowed: the proxy path always succeeds
// regardless of archival outcome.

use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sanitize a client address for use as a path component so a crafted
/// `X-Forwarded-For` cannot escape the archival root via `..` or `/`.
fn sanitize_path_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Compute (but do not create) the archive path for a new request body.
pub fn archive_path(data_dir: &Path, client_addr: &str) -> PathBuf {
    let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let ts = chrono::Utc::now().timestamp();
    let uuid = uuid::Uuid::new_v4();
    data_dir
        .join("requests")
        .join(sanitize_path_component(client_addr))
        .join(day)
        .join(format!("{ts}_{uuid}.json.gz"))
}

/// Gzip-compress `body` to `path`, creating parent directories as needed.
/// Errors are returned to the caller, which logs and swallows them.
pub fn write_body(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(body)?;
    encoder.finish()?;
    Ok(())
}

/// Best-effort archival: logs and swallows any failure.
pub fn archive_body_best_effort(data_dir: &Path, client_addr: &str, body: &[u8]) -> Option<PathBuf> {
    let path = archive_path(data_dir, client_addr);
    match write_body(&path, body) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("[archival] failed to write request body to {:?}: {}", path, e);
            None
        }
    }
}

/// Read back and decompress an archived body for the `/queries/{id}/body`
/// operator surface.
pub fn read_body(path: &Path) -> std::io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let file = std::fs::File::open(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_forwarded_for_injection() {
        let s = sanitize_path_component("../../etc/passwd");
        assert!(!s.contains('/'));
        assert!(!s.contains(".."));
    }

    #[test]
    fn round_trips_body_through_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json.gz");
        write_body(&path, b"hello world").unwrap();
        let back = read_body(&path).unwrap();
        assert_eq!(back, b"hello world");
    }

    #[test]
    fn archive_path_is_under_sanitized_client_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive_path(dir.path(), "1.2.3.4");
        assert!(path.starts_with(dir.path().join("requests").join("1.2.3.4")));
    }
}
