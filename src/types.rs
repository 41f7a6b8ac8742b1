//! Public result and option types exchanged with the host: file/directory
//! metadata, vector-read and page-read results, and open flags.

use bytes::Bytes;
use time::OffsetDateTime;

/// Flags the host passes to `File::open`, mirroring the POSIX-ish open
/// intent a data-transfer client expresses (read, write, create a new
/// object, or replace one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
    /// Start a whole-object streaming GET on open rather than a HEAD/PROPFIND
    /// stat, publishing properties as soon as the body is available.
    pub full_download: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            create: true,
            ..Default::default()
        }
    }
}

/// Metadata for a single file or directory entry, returned by `Stat` and as
/// each row of a `DirList`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatInfo {
    pub size: u64,
    pub is_dir: bool,
    pub executable: bool,
    pub modified: Option<OffsetDateTime>,
    pub etag: Option<String>,
}

/// One entry returned by `Filesystem::dir_list`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub stat: StatInfo,
}

/// One chunk of a `VectorRead`, paired with the file offset it was
/// requested at (not necessarily contiguous with its neighbors).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorReadPart {
    pub offset: u64,
    pub data: Bytes,
}

/// Result of a `VectorRead`: one part per requested chunk, in request
/// order. An empty request yields an empty result rather than an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorReadInfo {
    pub parts: Vec<VectorReadPart>,
}

impl VectorReadInfo {
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.data.len() as u64).sum()
    }
}

/// Result of a `PgRead`: the data plus one CRC32C checksum per 4 KiB page
/// (the final page may be short).
#[derive(Debug, Clone, PartialEq)]
pub struct PgReadInfo {
    pub data: Bytes,
    pub page_checksums: Vec<u32>,
}

pub const PG_PAGE_SIZE: usize = 4096;

impl PgReadInfo {
    pub fn from_data(data: Bytes) -> Self {
        let page_checksums = data.chunks(PG_PAGE_SIZE).map(crc32fast::hash).collect();
        Self {
            data,
            page_checksums,
        }
    }
}

/// Recognized checksum algorithms for `Query(Checksum)`, matching the
/// `Want-Digest`/`cks.type` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Crc32c,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Crc32c => "crc32c",
            ChecksumAlgorithm::Sha1 => "sha",
            ChecksumAlgorithm::Sha256 => "sha-256",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumAlgorithm::Md5),
            "crc32c" => Some(ChecksumAlgorithm::Crc32c),
            "sha" | "sha1" => Some(ChecksumAlgorithm::Sha1),
            "sha-256" | "sha256" => Some(ChecksumAlgorithm::Sha256),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of `Query(Checksum)`: `<algorithm> <hex digest>`, matching the
/// host-visible format from the end-to-end checksum scenarios.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecksumResult {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl std::fmt::Display for ChecksumResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.algorithm, self.hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_algorithm_parses_case_insensitively() {
        assert_eq!(ChecksumAlgorithm::parse("CRC32C"), Some(ChecksumAlgorithm::Crc32c));
        assert_eq!(ChecksumAlgorithm::parse("sha-256"), Some(ChecksumAlgorithm::Sha256));
        assert_eq!(ChecksumAlgorithm::parse("bogus"), None);
    }

    #[test]
    fn checksum_result_formats_as_algorithm_space_hex() {
        let result = ChecksumResult {
            algorithm: ChecksumAlgorithm::Md5,
            hex: "4a42dabcf0c6233b3dac41196313e748".to_string(),
        };
        assert_eq!(result.to_string(), "md5 4a42dabcf0c6233b3dac41196313e748");
    }

    #[test]
    fn pg_read_info_splits_pages_at_4kib() {
        let data = Bytes::from(vec![0u8; PG_PAGE_SIZE + 10]);
        let info = PgReadInfo::from_data(data);
        assert_eq!(info.page_checksums.len(), 2);
    }

    #[test]
    fn vector_read_info_sums_total_bytes() {
        let info = VectorReadInfo {
            parts: vec![
                VectorReadPart { offset: 0, data: Bytes::from_static(b"aa") },
                VectorReadPart { offset: 4, data: Bytes::from_static(b"dd") },
            ],
        };
        assert_eq!(info.total_bytes(), 4);
    }
}
