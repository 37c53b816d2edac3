//! Save states are zip containers holding one entry per named section.
//!
//! Sections are stored uncompressed in the order they were inserted and must
//! be read back in that same order. Writers stage the whole container in a
//! temporary file next to the destination and rename it into place, so a
//! failed save never leaves a truncated archive behind.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::StateError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    data: Vec<u8>,
}

/// Collects sections in memory until the archive is written out.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    sections: Vec<Section>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section. Names must be unique within an archive.
    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) -> Result<(), StateError> {
        let name = name.into();
        if self.sections.iter().any(|s| s.name == name) {
            return Err(StateError::DuplicateSection(name));
        }
        self.sections.push(Section { name, data });
        Ok(())
    }

    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.data.as_slice())
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Encode the archive into `out`, returning it once the container is
    /// complete.
    pub fn write_to<W: Write + Seek>(&self, out: W) -> Result<W, StateError> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = ZipWriter::new(out);
        for section in &self.sections {
            zip.start_file(section.name.as_str(), options)?;
            zip.write_all(&section.data)?;
        }
        Ok(zip.finish()?)
    }

    /// Write the archive to `path`, replacing any existing file only once the
    /// new one is complete.
    pub fn write_atomic(&self, path: &Path) -> Result<(), StateError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir)?;
        self.write_to(staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(path)?;
        Ok(())
    }
}

/// A decoded archive whose sections are consumed in write order.
#[derive(Debug)]
pub struct ArchiveReader {
    sections: Vec<Section>,
    cursor: usize,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, StateError> {
        let mut zip = ZipArchive::new(reader)?;
        let mut sections = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let name = entry.name().to_owned();
            let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry.read_to_end(&mut data)?;
            sections.push(Section { name, data });
        }
        Ok(Self {
            sections,
            cursor: 0,
        })
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// Return the next section called `name`. Sections before it are skipped;
    /// asking for a section that was already passed is an error.
    pub fn read_section(&mut self, name: &str) -> Result<&[u8], StateError> {
        if let Some(offset) = self.sections[self.cursor..]
            .iter()
            .position(|s| s.name == name)
        {
            let index = self.cursor + offset;
            self.cursor = index + 1;
            return Ok(&self.sections[index].data);
        }

        if self.sections[..self.cursor].iter().any(|s| s.name == name) {
            Err(StateError::SectionOutOfOrder(name.to_owned()))
        } else {
            Err(StateError::MissingSection(name.to_owned()))
        }
    }
}

/// Little-endian encoder for section payloads.
#[derive(Debug, Default)]
pub struct SectionWriter {
    buf: Vec<u8>,
}

impl SectionWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Length-prefixed (u32) byte blob. Blobs of 4 GiB or more do not fit
    /// the prefix and are rejected.
    pub fn write_blob(&mut self, data: &[u8]) -> Result<&mut Self, StateError> {
        self.write_u32(length_prefix(data.len())?);
        self.buf.extend_from_slice(data);
        Ok(self)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Convert a payload length to its on-disk u32 prefix.
pub fn length_prefix(len: usize) -> Result<u32, StateError> {
    u32::try_from(len).map_err(|_| StateError::Oversized(len))
}

/// Little-endian decoder for section payloads.
#[derive(Debug)]
pub struct SectionReader<'a> {
    section: &'a str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    pub fn new(section: &'a str, data: &'a [u8]) -> Self {
        Self {
            section,
            data,
            pos: 0,
        }
    }

    fn corrupt(&self, reason: &'static str) -> StateError {
        StateError::Corrupt {
            section: self.section.to_owned(),
            reason,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], StateError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.corrupt("truncated"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], StateError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, StateError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, StateError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.corrupt("invalid bool")),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, StateError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, StateError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, StateError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8], StateError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<(), StateError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(self.corrupt("trailing bytes"))
        }
    }
}
