//! Framed object files.
//!
//! A file starts with an 8-byte header
//! `[magic:u32 "SSDA"][version:u8][content_type:u8][reserved:u16]` and then
//! holds serialized objects in one of two layouts, dispatched on the
//! version byte:
//!
//! - version 0 (plain): repeated `[chunk_len:u32][crc32:u32][chunk bytes]`.
//! - version 1 (bunched): many chunks (in the version-0 framing) are
//!   concatenated and zstd-compressed into a bunch written as
//!   `[comp_len:u32][crc32:u32][compressed bytes]`; a trailer
//!   `[bunch_offset:u64 x n][n_bunches:u32][trailer_crc:u32]` locates the
//!   bunches for random access.
//!
//! Readers validate every crc32 and build an offset index on open so
//! entries are addressable by number. A wrong magic is fatal; a failed
//! chunk checksum is a per-chunk error the caller can skip.

use crate::error::{DaqError, DaqResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File magic: ASCII "SSDA".
pub const FILE_MAGIC: u32 = u32::from_le_bytes(*b"SSDA");

const HEADER_SIZE: usize = 8;
const CHUNK_HEADER_SIZE: usize = 8;
const VERSION_PLAIN: u8 = 0;
const VERSION_BUNCHED: u8 = 1;
/// Default uncompressed bunch size before a flush.
const DEFAULT_BUNCH_SIZE: usize = 1 << 20;

/// Tags the record kind stored in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Readout = 1,
    Trigger = 2,
    Monitor = 3,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ContentType::Readout),
            2 => Some(ContentType::Trigger),
            3 => Some(ContentType::Monitor),
            _ => None,
        }
    }
}

fn encode_header(version: u8, content_type: ContentType) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
    header[4] = version;
    header[5] = content_type as u8;
    header
}

fn frame_chunk(data: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(CHUNK_HEADER_SIZE + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
    framed.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    framed.extend_from_slice(data);
    framed
}

enum WriterMode {
    Plain,
    Bunched {
        pending: Vec<u8>,
        bunch_size: usize,
        bunch_offsets: Vec<u64>,
        position: u64,
    },
}

/// Appends serialized objects to a framed file.
pub struct RawObjectWriter {
    file: File,
    path: PathBuf,
    mode: WriterMode,
    data_counter: u64,
}

impl RawObjectWriter {
    /// Creates a plain (version 0) file.
    pub fn create<P: AsRef<Path>>(path: P, content_type: ContentType) -> DaqResult<Self> {
        let mut file = File::create(&path)?;
        file.write_all(&encode_header(VERSION_PLAIN, content_type))?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            mode: WriterMode::Plain,
            data_counter: 0,
        })
    }

    /// Creates a bunched (version 1) file with the default bunch size.
    pub fn create_bunched<P: AsRef<Path>>(path: P, content_type: ContentType) -> DaqResult<Self> {
        Self::create_bunched_with_size(path, content_type, DEFAULT_BUNCH_SIZE)
    }

    pub fn create_bunched_with_size<P: AsRef<Path>>(
        path: P,
        content_type: ContentType,
        bunch_size: usize,
    ) -> DaqResult<Self> {
        let mut file = File::create(&path)?;
        file.write_all(&encode_header(VERSION_BUNCHED, content_type))?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            mode: WriterMode::Bunched {
                pending: Vec::new(),
                bunch_size,
                bunch_offsets: Vec::new(),
                position: HEADER_SIZE as u64,
            },
            data_counter: 0,
        })
    }

    /// Number of objects written so far.
    pub fn data_counter(&self) -> u64 {
        self.data_counter
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to disk so far (bunched files exclude unflushed data).
    pub fn bytes_written(&self) -> DaqResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Appends one serialized object.
    pub fn write(&mut self, data: &[u8]) -> DaqResult<()> {
        match &mut self.mode {
            WriterMode::Plain => {
                self.file.write_all(&frame_chunk(data))?;
            }
            WriterMode::Bunched { pending, .. } => {
                pending.extend_from_slice(&frame_chunk(data));
            }
        }
        self.data_counter += 1;
        if let WriterMode::Bunched {
            pending,
            bunch_size,
            ..
        } = &self.mode
        {
            if pending.len() >= *bunch_size {
                self.flush_bunch()?;
            }
        }
        Ok(())
    }

    fn flush_bunch(&mut self) -> DaqResult<()> {
        if let WriterMode::Bunched {
            pending,
            bunch_offsets,
            position,
            ..
        } = &mut self.mode
        {
            if pending.is_empty() {
                return Ok(());
            }
            let compressed = zstd::encode_all(pending.as_slice(), 0)?;
            bunch_offsets.push(*position);
            self.file
                .write_all(&(compressed.len() as u32).to_le_bytes())?;
            self.file
                .write_all(&crc32fast::hash(&compressed).to_le_bytes())?;
            self.file.write_all(&compressed)?;
            *position += (CHUNK_HEADER_SIZE + compressed.len()) as u64;
            pending.clear();
        }
        Ok(())
    }

    /// Flushes any pending bunch, writes the trailer for bunched files and
    /// syncs the file.
    pub fn close(mut self) -> DaqResult<()> {
        self.flush_bunch()?;
        if let WriterMode::Bunched { bunch_offsets, .. } = &self.mode {
            let mut trailer = Vec::with_capacity(bunch_offsets.len() * 8);
            for offset in bunch_offsets {
                trailer.extend_from_slice(&offset.to_le_bytes());
            }
            let crc = crc32fast::hash(&trailer);
            self.file.write_all(&trailer)?;
            self.file
                .write_all(&(bunch_offsets.len() as u32).to_le_bytes())?;
            self.file.write_all(&crc.to_le_bytes())?;
        }
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

enum ReaderIndex {
    /// Chunk offsets into the file.
    Plain(Vec<u64>),
    /// Per bunch: file offset and the entry index of its first chunk.
    Bunched {
        bunches: Vec<(u64, usize)>,
        n_entries: usize,
        /// Cache of the last decompressed bunch.
        cached: Option<(usize, Vec<u8>)>,
    },
}

/// Reads a framed file, exposing entries by index.
pub struct RawObjectReader {
    file: File,
    content_type: Option<ContentType>,
    index: ReaderIndex,
    cursor: usize,
}

impl RawObjectReader {
    pub fn open<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FILE_MAGIC {
            return Err(DaqError::MalformedRecord(format!(
                "bad file magic {:#010x}, expected {:#010x}",
                magic, FILE_MAGIC
            )));
        }
        let content_type = ContentType::from_u8(header[5]);
        let index = match header[4] {
            VERSION_PLAIN => Self::scan_plain(&mut file)?,
            VERSION_BUNCHED => Self::scan_bunched(&mut file)?,
            other => return Err(DaqError::UnknownRecordType(other)),
        };
        Ok(Self {
            file,
            content_type,
            index,
            cursor: 0,
        })
    }

    fn scan_plain(file: &mut File) -> DaqResult<ReaderIndex> {
        let len = file.metadata()?.len();
        let mut offsets = Vec::new();
        let mut pos = HEADER_SIZE as u64;
        let mut chunk_header = [0u8; CHUNK_HEADER_SIZE];
        while pos + CHUNK_HEADER_SIZE as u64 <= len {
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut chunk_header)?;
            let size = u32::from_le_bytes([
                chunk_header[0],
                chunk_header[1],
                chunk_header[2],
                chunk_header[3],
            ]) as u64;
            if pos + CHUNK_HEADER_SIZE as u64 + size > len {
                // Truncated tail chunk, likely an interrupted writer.
                break;
            }
            offsets.push(pos);
            pos += CHUNK_HEADER_SIZE as u64 + size;
        }
        Ok(ReaderIndex::Plain(offsets))
    }

    fn scan_bunched(file: &mut File) -> DaqResult<ReaderIndex> {
        let len = file.metadata()?.len();
        if len < (HEADER_SIZE + 8) as u64 {
            return Err(DaqError::MalformedRecord("bunched file has no trailer".into()));
        }
        file.seek(SeekFrom::Start(len - 8))?;
        let mut tail = [0u8; 8];
        file.read_exact(&mut tail)?;
        let n_bunches = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as usize;
        let stored_crc = u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]);
        let trailer_len = n_bunches as u64 * 8;
        if len < (HEADER_SIZE as u64) + trailer_len + 8 {
            return Err(DaqError::MalformedRecord("bunched trailer truncated".into()));
        }
        file.seek(SeekFrom::Start(len - 8 - trailer_len))?;
        let mut trailer = vec![0u8; trailer_len as usize];
        file.read_exact(&mut trailer)?;
        let computed = crc32fast::hash(&trailer);
        if computed != stored_crc {
            return Err(DaqError::CrcMismatch {
                index: 0,
                stored: stored_crc,
                computed,
            });
        }

        let mut bunches = Vec::with_capacity(n_bunches);
        let mut n_entries = 0usize;
        for i in 0..n_bunches {
            let mut word = [0u8; 8];
            word.copy_from_slice(&trailer[i * 8..i * 8 + 8]);
            let offset = u64::from_le_bytes(word);
            bunches.push((offset, n_entries));
            let stream = Self::read_bunch_at(file, offset, i)?;
            n_entries += count_chunks(&stream)?;
        }
        Ok(ReaderIndex::Bunched {
            bunches,
            n_entries,
            cached: None,
        })
    }

    fn read_bunch_at(file: &mut File, offset: u64, index: usize) -> DaqResult<Vec<u8>> {
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk_header = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut chunk_header)?;
        let size = u32::from_le_bytes([
            chunk_header[0],
            chunk_header[1],
            chunk_header[2],
            chunk_header[3],
        ]) as usize;
        let stored = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]);
        let mut compressed = vec![0u8; size];
        file.read_exact(&mut compressed)?;
        let computed = crc32fast::hash(&compressed);
        if computed != stored {
            return Err(DaqError::CrcMismatch {
                index,
                stored,
                computed,
            });
        }
        Ok(zstd::decode_all(compressed.as_slice())?)
    }

    /// Record kind stored in this file, if the tag byte was recognized.
    pub fn content_type(&self) -> Option<ContentType> {
        self.content_type
    }

    /// Number of addressable entries.
    pub fn n_entries(&self) -> usize {
        match &self.index {
            ReaderIndex::Plain(offsets) => offsets.len(),
            ReaderIndex::Bunched { n_entries, .. } => *n_entries,
        }
    }

    /// Random access read with crc validation.
    pub fn read_at(&mut self, index: usize) -> DaqResult<Vec<u8>> {
        match &mut self.index {
            ReaderIndex::Plain(offsets) => {
                let offset = *offsets.get(index).ok_or_else(|| {
                    DaqError::MalformedRecord(format!("entry {} out of range", index))
                })?;
                self.file.seek(SeekFrom::Start(offset))?;
                let mut chunk_header = [0u8; CHUNK_HEADER_SIZE];
                self.file.read_exact(&mut chunk_header)?;
                let size = u32::from_le_bytes([
                    chunk_header[0],
                    chunk_header[1],
                    chunk_header[2],
                    chunk_header[3],
                ]) as usize;
                let stored = u32::from_le_bytes([
                    chunk_header[4],
                    chunk_header[5],
                    chunk_header[6],
                    chunk_header[7],
                ]);
                let mut data = vec![0u8; size];
                self.file.read_exact(&mut data)?;
                let computed = crc32fast::hash(&data);
                if computed != stored {
                    return Err(DaqError::CrcMismatch {
                        index,
                        stored,
                        computed,
                    });
                }
                Ok(data)
            }
            ReaderIndex::Bunched {
                bunches,
                n_entries,
                cached,
            } => {
                if index >= *n_entries {
                    return Err(DaqError::MalformedRecord(format!(
                        "entry {} out of range",
                        index
                    )));
                }
                // Last bunch whose first entry is <= index.
                let bunch_idx = match bunches.binary_search_by_key(&index, |(_, first)| *first) {
                    Ok(i) => i,
                    Err(i) => i - 1,
                };
                let (offset, first_entry) = bunches[bunch_idx];
                let stream = match cached {
                    Some((cached_idx, stream)) if *cached_idx == bunch_idx => stream.clone(),
                    _ => {
                        let stream = Self::read_bunch_at(&mut self.file, offset, bunch_idx)?;
                        *cached = Some((bunch_idx, stream.clone()));
                        stream
                    }
                };
                read_chunk_in_stream(&stream, index - first_entry, index)
            }
        }
    }

    /// Sequential read; returns `None` at end of file. The cursor moves past
    /// an unreadable entry, so a caller may log the error and keep scanning.
    pub fn read_next(&mut self) -> DaqResult<Option<Vec<u8>>> {
        if self.cursor >= self.n_entries() {
            return Ok(None);
        }
        let index = self.cursor;
        self.cursor += 1;
        Ok(Some(self.read_at(index)?))
    }

    /// Rewinds the sequential cursor.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

fn count_chunks(stream: &[u8]) -> DaqResult<usize> {
    let mut pos = 0usize;
    let mut count = 0usize;
    while pos + CHUNK_HEADER_SIZE <= stream.len() {
        let size =
            u32::from_le_bytes([stream[pos], stream[pos + 1], stream[pos + 2], stream[pos + 3]])
                as usize;
        pos += CHUNK_HEADER_SIZE + size;
        if pos > stream.len() {
            return Err(DaqError::MalformedRecord("bunch stream truncated".into()));
        }
        count += 1;
    }
    Ok(count)
}

fn read_chunk_in_stream(stream: &[u8], nth: usize, entry_index: usize) -> DaqResult<Vec<u8>> {
    let mut pos = 0usize;
    let mut seen = 0usize;
    while pos + CHUNK_HEADER_SIZE <= stream.len() {
        let size =
            u32::from_le_bytes([stream[pos], stream[pos + 1], stream[pos + 2], stream[pos + 3]])
                as usize;
        let stored = u32::from_le_bytes([
            stream[pos + 4],
            stream[pos + 5],
            stream[pos + 6],
            stream[pos + 7],
        ]);
        let start = pos + CHUNK_HEADER_SIZE;
        let end = start + size;
        if end > stream.len() {
            return Err(DaqError::MalformedRecord("bunch stream truncated".into()));
        }
        if seen == nth {
            let data = stream[start..end].to_vec();
            let computed = crc32fast::hash(&data);
            if computed != stored {
                return Err(DaqError::CrcMismatch {
                    index: entry_index,
                    stored,
                    computed,
                });
            }
            return Ok(data);
        }
        seen += 1;
        pos = end;
    }
    Err(DaqError::MalformedRecord(format!(
        "entry {} missing from bunch",
        entry_index
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip_with_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objects.dat");
        let mut writer = RawObjectWriter::create(&path, ContentType::Trigger).unwrap();
        for i in 0u8..10 {
            writer.write(&vec![i; (i as usize + 1) * 3]).unwrap();
        }
        assert_eq!(writer.data_counter(), 10);
        writer.close().unwrap();

        let mut reader = RawObjectReader::open(&path).unwrap();
        assert_eq!(reader.n_entries(), 10);
        assert_eq!(reader.content_type(), Some(ContentType::Trigger));
        assert_eq!(reader.read_at(4).unwrap(), vec![4u8; 15]);
        assert_eq!(reader.read_next().unwrap().unwrap(), vec![0u8; 3]);
    }

    #[test]
    fn corrupted_chunk_fails_crc_but_not_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objects.dat");
        let mut writer = RawObjectWriter::create(&path, ContentType::Readout).unwrap();
        writer.write(b"first").unwrap();
        writer.write(b"second").unwrap();
        writer.close().unwrap();

        // Flip a byte inside the first chunk payload.
        let mut contents = std::fs::read(&path).unwrap();
        contents[HEADER_SIZE + CHUNK_HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, &contents).unwrap();

        let mut reader = RawObjectReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_at(0).unwrap_err(),
            DaqError::CrcMismatch { index: 0, .. }
        ));
        assert_eq!(reader.read_at(1).unwrap(), b"second".to_vec());
    }

    #[test]
    fn sequential_scan_skips_past_a_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objects.dat");
        let mut writer = RawObjectWriter::create(&path, ContentType::Readout).unwrap();
        writer.write(b"first").unwrap();
        writer.write(b"second").unwrap();
        writer.write(b"third").unwrap();
        writer.close().unwrap();

        // Flip a byte inside the second chunk payload.
        let mut contents = std::fs::read(&path).unwrap();
        let second = HEADER_SIZE + 2 * CHUNK_HEADER_SIZE + b"first".len();
        contents[second] ^= 0xFF;
        std::fs::write(&path, &contents).unwrap();

        let mut reader = RawObjectReader::open(&path).unwrap();
        assert_eq!(reader.read_next().unwrap().unwrap(), b"first".to_vec());
        assert!(matches!(
            reader.read_next().unwrap_err(),
            DaqError::CrcMismatch { index: 1, .. }
        ));
        assert_eq!(reader.read_next().unwrap().unwrap(), b"third".to_vec());
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_ssda.dat");
        std::fs::write(&path, b"XXXX\x00\x01\x00\x00somebytes").unwrap();
        assert!(matches!(
            RawObjectReader::open(&path).err(),
            Some(DaqError::MalformedRecord(_))
        ));
    }

    #[test]
    fn bunched_roundtrip_across_bunches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bunched.dat");
        // Tiny bunch size so every couple of writes rolls a new bunch.
        let mut writer =
            RawObjectWriter::create_bunched_with_size(&path, ContentType::Readout, 64).unwrap();
        let entries: Vec<Vec<u8>> = (0u8..25).map(|i| vec![i; 40]).collect();
        for entry in &entries {
            writer.write(entry).unwrap();
        }
        writer.close().unwrap();

        let mut reader = RawObjectReader::open(&path).unwrap();
        assert_eq!(reader.n_entries(), 25);
        // Random access ordering should not matter.
        assert_eq!(reader.read_at(24).unwrap(), entries[24]);
        assert_eq!(reader.read_at(0).unwrap(), entries[0]);
        assert_eq!(reader.read_at(13).unwrap(), entries[13]);
        // Sequential scan sees everything in order.
        reader.rewind();
        for entry in &entries {
            assert_eq!(&reader.read_next().unwrap().unwrap(), entry);
        }
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn truncated_plain_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.dat");
        let mut writer = RawObjectWriter::create(&path, ContentType::Monitor).unwrap();
        writer.write(b"complete").unwrap();
        writer.write(b"gone").unwrap();
        writer.close().unwrap();

        let contents = std::fs::read(&path).unwrap();
        std::fs::write(&path, &contents[..contents.len() - 2]).unwrap();

        let mut reader = RawObjectReader::open(&path).unwrap();
        assert_eq!(reader.n_entries(), 1);
        assert_eq!(reader.read_at(0).unwrap(), b"complete".to_vec());
    }
}
