use crate::commitlog::io_worker::IoWorker;
use crate::commitlog::{Entry, Index, Log, StorageError};
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const LENGTH_LEN: usize = 4;
const CHECKSUM_LEN: usize = 4;
const FRAME_HEADER_LEN: usize = LENGTH_LEN + CHECKSUM_LEN;

/// FileLog is the durable log. Every entry is one frame in a single append-only file:
///
/// ```text
/// +----------------------+-----------------------+------------------------------+
/// | Length (4 bytes, BE) | CRC32 (4 bytes, BE)   | Entry bytes (`Length` bytes) |
/// +----------------------+-----------------------+------------------------------+
/// ```
///
/// The CRC covers the entry bytes. The whole file is parsed and every frame checked and decoded on
/// open. A torn trailing frame, a checksum mismatch, or an entry that doesn't decode is reported
/// as `CorruptStorage` and the file is left untouched. Reads check the checksum again.
///
/// File operations run on the log's own IO thread and give up after the storage timeout.
pub struct FileLog<E: Entry> {
    path: PathBuf,
    file: Arc<File>,
    worker: IoWorker,
    // offsets[i] is where the frame for index i+1 starts.
    offsets: Vec<u64>,
    end_offset: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> FileLog<E> {
    pub fn open(path: impl AsRef<Path>, storage_timeout: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut offsets = Vec::new();
        let mut pos = 0usize;
        while pos < contents.len() {
            let index = offsets.len() + 1;
            let remaining = &contents[pos..];
            if remaining.len() < FRAME_HEADER_LEN {
                return Err(StorageError::corrupt(
                    &path,
                    format!("{} trailing bytes at offset {} can't hold a frame header", remaining.len(), pos),
                ));
            }

            let frame_len = FRAME_HEADER_LEN + body_len(remaining);
            if frame_len > remaining.len() {
                return Err(StorageError::corrupt(
                    &path,
                    format!(
                        "frame at offset {} claims {} bytes but only {} remain",
                        pos,
                        frame_len - FRAME_HEADER_LEN,
                        remaining.len() - FRAME_HEADER_LEN
                    ),
                ));
            }

            let body = checked_body(&remaining[..frame_len])
                .map_err(|reason| StorageError::corrupt(&path, format!("entry {} at offset {}: {}", index, pos, reason)))?;
            if let Err(e) = E::try_from(body.to_vec()) {
                return Err(StorageError::corrupt(
                    &path,
                    format!("entry {} at offset {}: {}", index, pos, e),
                ));
            }

            offsets.push(pos as u64);
            pos += frame_len;
        }

        let worker_name = format!("log-io-{}", path.display());
        Ok(FileLog {
            worker: IoWorker::spawn(&worker_name, storage_timeout)?,
            path,
            file: Arc::new(file),
            offsets,
            end_offset: contents.len() as u64,
            _pd: PhantomData::default(),
        })
    }

    fn frame_position(&self, index: Index) -> Option<usize> {
        let position = (index.as_u64() - 1) as usize;
        if position < self.offsets.len() {
            Some(position)
        } else {
            None
        }
    }

    fn frame_end(&self, position: usize) -> u64 {
        self.offsets
            .get(position + 1)
            .copied()
            .unwrap_or(self.end_offset)
    }
}

fn body_len(frame: &[u8]) -> usize {
    let mut len_bytes = [0u8; LENGTH_LEN];
    len_bytes.copy_from_slice(&frame[..LENGTH_LEN]);
    u32::from_be_bytes(len_bytes) as usize
}

/// Verifies a whole frame and returns its entry bytes.
fn checked_body(frame: &[u8]) -> Result<&[u8], String> {
    if frame.len() < FRAME_HEADER_LEN || frame.len() != FRAME_HEADER_LEN + body_len(frame) {
        return Err(format!("frame of {} bytes doesn't match its length header", frame.len()));
    }

    let mut crc_bytes = [0u8; CHECKSUM_LEN];
    crc_bytes.copy_from_slice(&frame[LENGTH_LEN..FRAME_HEADER_LEN]);
    let expected = u32::from_be_bytes(crc_bytes);

    let body = &frame[FRAME_HEADER_LEN..];
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(format!("checksum mismatch: stored {:#010x}, computed {:#010x}", expected, actual));
    }

    Ok(body)
}

fn encode_frame(body: &[u8]) -> Result<Vec<u8>, io::Error> {
    let body_len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "log entry larger than 4GiB"))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(body).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

impl<E: Entry> Log<E> for FileLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let bytes: Vec<u8> = entry.into();
        let frame = encode_frame(&bytes)?;
        let start = self.end_offset;
        let end = start + frame.len() as u64;

        let file = self.file.clone();
        self.worker.run(move || {
            let mut file: &File = &file;
            // set_len also cuts off anything a timed out append left past `start`.
            let written = file
                .seek(SeekFrom::Start(start))
                .and_then(|_| file.write_all(&frame))
                .and_then(|_| file.set_len(end));
            if let Err(e) = written {
                // Drop whatever part of the frame made it to the file so the next open doesn't see
                // a torn record.
                let _ = file.set_len(start);
                return Err(e);
            }
            Ok(())
        })?;

        self.offsets.push(start);
        self.end_offset = end;

        Ok(Index::new_usize(self.offsets.len()))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let position = match self.frame_position(index) {
            Some(p) => p,
            None => return Ok(None),
        };
        let start = self.offsets[position];
        let end = self.frame_end(position);

        let file = self.file.clone();
        let frame = self.worker.run(move || {
            let mut file: &File = &file;
            let mut buf = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut buf)?;
            Ok(buf)
        })?;

        let body = checked_body(&frame).map_err(|reason| {
            StorageError::corrupt(&self.path, format!("entry {} at offset {}: {}", index, start, reason)).into_io()
        })?;

        Ok(Some(E::try_from(body.to_vec())?))
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let position = match self.frame_position(index) {
            Some(p) => p,
            None => return Ok(()),
        };
        let new_end = self.offsets[position];

        let file = self.file.clone();
        self.worker.run(move || {
            file.set_len(new_end)?;
            file.sync_all()
        })?;

        self.offsets.truncate(position);
        self.end_offset = new_end;

        Ok(())
    }

    fn next_index(&self) -> Index {
        Index::new_usize(self.offsets.len() + 1)
    }

    fn sync(&mut self) -> Result<(), io::Error> {
        let file = self.file.clone();
        self.worker.run(move || file.sync_data())
    }
}
