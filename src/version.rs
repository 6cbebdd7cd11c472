// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::WriteBytesExt;

/// Marker stored in the first byte of every binary file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    /// Immutable index table
    PTable,

    /// Transaction log chunk
    Chunk,
}

impl From<FileType> for u8 {
    fn from(value: FileType) -> Self {
        match value {
            FileType::PTable => 1,
            FileType::Chunk => 2,
        }
    }
}

impl TryFrom<u8> for FileType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::PTable),
            2 => Ok(Self::Chunk),
            _ => Err(()),
        }
    }
}

/// Disk format version
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Version {
    /// Fixed-width 24 byte index entries, 64-bit stream hashes, midpoints stored in the file
    V1,
}

impl Version {
    /// The version new files are written with
    pub const CURRENT: Self = Self::V1;
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<Version> for u8 {
    fn from(value: Version) -> Self {
        match value {
            Version::V1 => 1,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            _ => Err(()),
        }
    }
}

/// Problem found in the first two bytes of a file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeaderError {
    /// Unknown or unexpected file type marker
    FileType(u8),

    /// Unknown format version
    Version(u8),
}

/// Parses the `[file type][version]` prefix shared by chunks and tables
pub fn parse_file_header(bytes: &[u8], expected: FileType) -> Result<Version, HeaderError> {
    let Some(&file_type) = bytes.first() else {
        return Err(HeaderError::FileType(0));
    };

    match FileType::try_from(file_type) {
        Ok(ft) if ft == expected => {}
        _ => return Err(HeaderError::FileType(file_type)),
    }

    let Some(&version) = bytes.get(1) else {
        return Err(HeaderError::Version(0));
    };

    Version::try_from(version).map_err(|()| HeaderError::Version(version))
}

pub fn write_file_header<W: std::io::Write>(
    writer: &mut W,
    file_type: FileType,
    version: Version,
) -> std::io::Result<()> {
    writer.write_u8(u8::from(file_type))?;
    writer.write_u8(u8::from(version))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    pub fn file_header_serialize() -> crate::Result<()> {
        let mut bytes = vec![];
        write_file_header(&mut bytes, FileType::PTable, Version::V1)?;
        assert_eq!(bytes, &[1, 1]);
        Ok(())
    }

    #[test]
    pub fn file_header_deserialize_success() {
        assert_eq!(Ok(Version::V1), parse_file_header(&[2, 1], FileType::Chunk));
    }

    #[test]
    pub fn file_header_wrong_type() {
        assert_eq!(
            Err(HeaderError::FileType(2)),
            parse_file_header(&[2, 1], FileType::PTable)
        );
        assert_eq!(
            Err(HeaderError::FileType(77)),
            parse_file_header(&[77, 1], FileType::PTable)
        );
    }

    #[test]
    pub fn file_header_unknown_version() {
        assert_eq!(
            Err(HeaderError::Version(9)),
            parse_file_header(&[1, 9], FileType::PTable)
        );
    }
}
