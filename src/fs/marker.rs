//! Per-file rewrite marker
//!
//! Every successfully rewritten file is tagged with an extended
//! attribute recording the codec it was rewritten under and the mtime
//! it carried at the time. A later run with the same target codec can
//! then skip the file, and any external modification (which changes
//! the mtime) invalidates the record.

use crate::error::{Result, ZfsRecompError};
use std::path::Path;

/// Name of the marker extended attribute.
pub const MARKER_XATTR: &str = "trusted.ZFSCTool:compress";

/// Parsed marker value: `"<codec>@<mtime_sec>:<mtime_usec>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Codec name recorded at rewrite time (carried verbatim; values
    /// outside the supported target set still compare textually)
    pub codec: String,
    /// Seconds part of the recorded mtime
    pub mtime_sec: i64,
    /// Microseconds part of the recorded mtime
    pub mtime_usec: i64,
}

impl Marker {
    /// Parse a raw attribute value. Anything that does not split into
    /// exactly codec, seconds and microseconds is treated as absent.
    pub fn parse(raw: &[u8]) -> Option<Marker> {
        let text = std::str::from_utf8(raw).ok()?;
        let (codec, times) = text.split_once('@')?;
        let (sec, usec) = times.split_once(':')?;
        if codec.is_empty() {
            return None;
        }
        Some(Marker {
            codec: codec.to_string(),
            mtime_sec: sec.parse::<u64>().ok()? as i64,
            mtime_usec: usec.parse::<u64>().ok()? as i64,
        })
    }

    /// Render the attribute value for `codec` and an mtime.
    pub fn format(codec: &str, mtime_sec: i64, mtime_usec: i64) -> String {
        format!("{}@{}:{}", codec, mtime_sec, mtime_usec)
    }
}

/// Read and parse the marker on `path`, treating every failure
/// (missing attribute, unreadable, malformed) as absence.
pub fn read_marker(path: &Path) -> Option<Marker> {
    match xattr::get(path, MARKER_XATTR) {
        Ok(Some(raw)) => Marker::parse(&raw),
        _ => None,
    }
}

/// Write the marker on `path`.
///
/// EACCES and EPERM are tolerated silently: setting a `trusted.`
/// attribute needs privileges the running user may not have, and a
/// missing marker only costs a re-examination on the next run.
pub fn write_marker(path: &Path, codec: &str, mtime_sec: i64, mtime_usec: i64) -> Result<()> {
    let value = Marker::format(codec, mtime_sec, mtime_usec);
    match xattr::set(path, MARKER_XATTR, value.as_bytes()) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM)) => {
            tracing::debug!(
                "cannot set {}={} on '{}': {}",
                MARKER_XATTR,
                value,
                path.display(),
                e
            );
            Ok(())
        }
        Err(e) => Err(ZfsRecompError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let value = Marker::format("gzip-6", 1714321098, 338211);
        let marker = Marker::parse(value.as_bytes()).unwrap();
        assert_eq!(marker.codec, "gzip-6");
        assert_eq!(marker.mtime_sec, 1714321098);
        assert_eq!(marker.mtime_usec, 338211);
    }

    #[test]
    fn test_parse_tolerates_unknown_codec() {
        let marker = Marker::parse(b"zstd-19@10:20").unwrap();
        assert_eq!(marker.codec, "zstd-19");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Marker::parse(b"").is_none());
        assert!(Marker::parse(b"lz4").is_none());
        assert!(Marker::parse(b"lz4@123").is_none());
        assert!(Marker::parse(b"@123:456").is_none());
        assert!(Marker::parse(b"lz4@abc:456").is_none());
        assert!(Marker::parse(b"lz4@123:-4").is_none());
        assert!(Marker::parse(b"lz4@123:456:789").is_none());
        assert!(Marker::parse(&[0xff, 0xfe, b'@', b'1', b':', b'2']).is_none());
    }

    #[test]
    fn test_read_marker_absent_on_plain_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();
        assert!(read_marker(&path).is_none());
    }
}
