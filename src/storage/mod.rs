//! On-disk storage: the file layout dictated by the metainfo and the sink
//! task that persists verified pieces.
//!
//! The torrent's payload is the concatenation of its files in `files` list
//! order, split into pieces. A piece (or a block within one) may straddle
//! file boundaries, so every write and read goes through [`FileLayout`],
//! which maps a (piece, offset, length) range to one slice per touched
//! file.
use crate::torrent::TorrentFile;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Range {piece}+{offset}..{length} outside the torrent payload")]
    OutOfRange { piece: u32, offset: u32, length: u32 },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A verified piece on its way to disk.
#[derive(Debug)]
pub struct VerifiedPiece {
    pub index: u32,
    pub data: Vec<u8>,
}

/// One output file with its position in the concatenated payload.
#[derive(Debug, Clone)]
struct FileSpan {
    path: PathBuf,
    /// Offset of the file's first byte within the payload.
    start: u64,
    length: u64,
}

/// A byte range of the payload resolved to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub path: PathBuf,
    pub file_offset: u64,
    pub length: u64,
}

/// The mapping from piece space to the on-disk file tree.
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileSpan>,
    piece_length: u64,
    total_length: u64,
}

impl FileLayout {
    /// Builds the layout rooted at `output_dir`: a single file named
    /// `info.name`, or a directory `info.name` containing each entry of
    /// the `files` list.
    pub fn new(torrent: &TorrentFile, output_dir: &Path) -> Self {
        let mut files = Vec::new();
        let mut start = 0u64;
        if !torrent.info.is_directory {
            files.push(FileSpan {
                path: output_dir.join(&torrent.info.name),
                start: 0,
                length: torrent.total_length() as u64,
            });
            start = torrent.total_length() as u64;
        } else {
            let root = output_dir.join(&torrent.info.name);
            for file in &torrent.info.files {
                let mut path = root.clone();
                for component in &file.path {
                    path = path.join(component);
                }
                files.push(FileSpan {
                    path,
                    start,
                    length: file.length as u64,
                });
                start += file.length as u64;
            }
        }
        Self {
            files,
            piece_length: torrent.info.piece_length as u64,
            total_length: start,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Resolves a (piece, offset, length) range to per-file slices, in
    /// payload order. The standard straddling split: a range covers the
    /// tail of one file and the head of the next when it crosses the
    /// boundary.
    pub fn locate(&self, piece: u32, offset: u32, length: u32) -> StorageResult<Vec<FileSlice>> {
        let begin = piece as u64 * self.piece_length + offset as u64;
        let end = begin + length as u64;
        if end > self.total_length {
            return Err(StorageError::OutOfRange {
                piece,
                offset,
                length,
            });
        }

        let mut slices = Vec::new();
        for file in &self.files {
            let file_end = file.start + file.length;
            if file_end <= begin || file.start >= end {
                continue;
            }
            let slice_start = begin.max(file.start);
            let slice_end = end.min(file_end);
            slices.push(FileSlice {
                path: file.path.clone(),
                file_offset: slice_start - file.start,
                length: slice_end - slice_start,
            });
        }
        Ok(slices)
    }

    /// Creates every output file at its final size (and any parent
    /// directories), so pieces can be written at their offsets in any
    /// order.
    #[instrument(level = "debug", skip(self))]
    pub async fn allocate(&self) -> StorageResult<()> {
        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&file.path)
                .await?;
            handle.set_len(file.length).await?;
        }
        info!(files = self.files.len(), "output files allocated");
        Ok(())
    }

    /// Writes one piece's bytes at their mapped offsets.
    pub async fn write_piece(&self, piece: u32, data: &[u8]) -> StorageResult<()> {
        let slices = self.locate(piece, 0, data.len() as u32)?;
        let mut consumed = 0usize;
        for slice in slices {
            let mut handle = OpenOptions::new().write(true).open(&slice.path).await?;
            handle.seek(SeekFrom::Start(slice.file_offset)).await?;
            handle
                .write_all(&data[consumed..consumed + slice.length as usize])
                .await?;
            consumed += slice.length as usize;
        }
        Ok(())
    }

    /// Reads a block back from disk, for serving a remote Request.
    pub async fn read_block(&self, piece: u32, offset: u32, length: u32) -> StorageResult<Vec<u8>> {
        let slices = self.locate(piece, offset, length)?;
        let mut data = Vec::with_capacity(length as usize);
        for slice in slices {
            let mut handle = OpenOptions::new().read(true).open(&slice.path).await?;
            handle.seek(SeekFrom::Start(slice.file_offset)).await?;
            let mut chunk = vec![0u8; slice.length as usize];
            handle.read_exact(&mut chunk).await?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

/// Consumes verified pieces from the bounded channel and writes them out.
/// Runs until the channel closes (every sender dropped), which doubles as
/// the flush on shutdown. A write failure is fatal for the download, so it
/// is returned rather than swallowed.
#[instrument(level = "debug", skip_all)]
pub async fn run_sink(
    layout: std::sync::Arc<FileLayout>,
    mut rx: mpsc::Receiver<VerifiedPiece>,
) -> StorageResult<()> {
    while let Some(piece) = rx.recv().await {
        debug!(piece = piece.index, bytes = piece.data.len(), "writing piece");
        layout.write_piece(piece.index, &piece.data).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn multi_file_torrent() -> TorrentFile {
        // two files of 700 + 324 bytes, 512-byte pieces
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce20:http://t.example/ann4:infod5:filesl");
        raw.extend_from_slice(b"d6:lengthi700e4:pathl1:a5:b.txteed6:lengthi324e4:pathl5:c.binee");
        raw.extend_from_slice(b"e4:name3:dir12:piece lengthi512e6:pieces40:");
        raw.extend_from_slice(&[0u8; 40]);
        raw.extend_from_slice(b"ee");
        TorrentFile::from_bytes(&raw).expect("parse")
    }

    #[test]
    fn locates_straddling_ranges() {
        let torrent = multi_file_torrent();
        let layout = FileLayout::new(&torrent, Path::new("/tmp/out"));

        // piece 1 starts at byte 512 and ends at 1024, crossing the
        // boundary at byte 700
        let slices = layout.locate(1, 0, 512).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].path, Path::new("/tmp/out/dir/a/b.txt"));
        assert_eq!(slices[0].file_offset, 512);
        assert_eq!(slices[0].length, 188);
        assert_eq!(slices[1].path, Path::new("/tmp/out/dir/c.bin"));
        assert_eq!(slices[1].file_offset, 0);
        assert_eq!(slices[1].length, 324);

        // a range inside one file maps to one slice
        let slices = layout.locate(0, 100, 64).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].file_offset, 100);

        assert!(matches!(
            layout.locate(1, 0, 513),
            Err(StorageError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn writes_and_reads_back_across_boundaries() {
        let torrent = multi_file_torrent();
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = FileLayout::new(&torrent, dir.path());
        layout.allocate().await.expect("allocate");

        let piece0: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
        let piece1: Vec<u8> = (0..512u32).map(|i| ((i * 7) % 256) as u8).collect();
        layout.write_piece(1, &piece1).await.expect("write 1");
        layout.write_piece(0, &piece0).await.expect("write 0");

        // block read crossing the file boundary
        let block = layout.read_block(1, 100, 300).await.expect("read");
        assert_eq!(block, &piece1[100..400]);

        // whole files landed with the right sizes
        let meta_a = std::fs::metadata(dir.path().join("dir/a/b.txt")).unwrap();
        assert_eq!(meta_a.len(), 700);
        let meta_c = std::fs::metadata(dir.path().join("dir/c.bin")).unwrap();
        assert_eq!(meta_c.len(), 324);
    }

    #[tokio::test]
    async fn sink_drains_channel_to_disk() {
        let torrent = multi_file_torrent();
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = std::sync::Arc::new(FileLayout::new(&torrent, dir.path()));
        layout.allocate().await.expect("allocate");

        let (tx, rx) = mpsc::channel(4);
        let sink = tokio::spawn(run_sink(layout.clone(), rx));

        tx.send(VerifiedPiece {
            index: 0,
            data: vec![0xAA; 512],
        })
        .await
        .unwrap();
        drop(tx);
        sink.await.unwrap().expect("sink");

        let block = layout.read_block(0, 0, 512).await.expect("read");
        assert_eq!(block, vec![0xAA; 512]);
    }
}
