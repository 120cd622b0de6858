//! Format keys and compression levels.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// String-keyed archive format identifier.
///
/// The built-in keys are exposed as associated constants; any other string is
/// a valid key for formats registered by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Format(Cow<'static, str>);

impl Format {
    /// Single file copied byte-for-byte.
    pub const RAW: Format = Format(Cow::Borrowed("raw"));
    /// Concatenated gzip streams, one per file.
    pub const GZIP: Format = Format(Cow::Borrowed("gzip"));
    /// Zip archive.
    pub const ZIP: Format = Format(Cow::Borrowed("zip"));
    /// Tar stream inside a zstd frame.
    pub const TAR_ZSTD: Format = Format(Cow::Borrowed("tarzstd"));

    /// Create a format key from an arbitrary string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(Cow::Owned(key.into()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Format {
    fn from(s: &str) -> Self {
        match s {
            "raw" => Self::RAW,
            "gzip" => Self::GZIP,
            "zip" => Self::ZIP,
            "tarzstd" => Self::TAR_ZSTD,
            other => Self::new(other),
        }
    }
}

/// Compression level, from fastest (lowest ratio) to slowest (highest ratio).
///
/// Each codec maps these onto its own native levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i8)]
pub enum CompressionLevel {
    Fastest = -2,
    Fast = -1,
    #[default]
    Default = 0,
    Slow = 1,
    Slowest = 2,
}

impl CompressionLevel {
    /// Parse a level name, falling back to `Default` for anything unknown.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            if !value.is_empty() {
                tracing::warn!(level = value, "unknown compression level, using default");
            }
            Self::Default
        })
    }

    /// Deflate level used by the zip codecs; `None` selects `Store`.
    pub fn deflate_level(self) -> Option<u32> {
        match self {
            Self::Fastest => None,
            Self::Fast => Some(1),
            Self::Default => Some(5),
            Self::Slow => Some(7),
            Self::Slowest => Some(9),
        }
    }

    /// Gzip level used by the stream-concat codec.
    pub fn gzip_level(self) -> u32 {
        match self {
            Self::Fastest => 1,
            Self::Fast => 3,
            Self::Default => 6,
            Self::Slow => 7,
            Self::Slowest => 9,
        }
    }

    /// zstd level used by the tar+zstd codec.
    pub fn zstd_level(self) -> i32 {
        match self {
            Self::Fastest | Self::Fast => 1,
            Self::Default => 3,
            Self::Slow => 7,
            Self::Slowest => 11,
        }
    }
}

impl FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fastest" => Ok(Self::Fastest),
            "fast" => Ok(Self::Fast),
            "default" => Ok(Self::Default),
            "slow" => Ok(Self::Slow),
            "slowest" => Ok(Self::Slowest),
            other => Err(format!("unknown compression level: {}", other)),
        }
    }
}
