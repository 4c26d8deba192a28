//! Line-oriented reading of a log file that a child process may still be writing.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// A seekable cursor over a captured output file.
///
/// The reader opens the file read-only and never truncates or locks it, so the
/// writing child is not disturbed. Every read returns the absolute byte offset the
/// cursor ends at, which lets callers follow a growing file incrementally.
pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl LogReader {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        debug!("Opened log reader on {}", path.display());

        Ok(Self {
            path,
            reader: BufReader::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current absolute position of the cursor
    pub async fn position(&mut self) -> std::io::Result<u64> {
        self.reader.stream_position().await
    }

    /// Seek to `from`, then copy up to `max_lines` lines into `sink`.
    ///
    /// A trailing line without a newline is copied as is. Returns the absolute
    /// offset after the last copied byte.
    pub async fn read_lines<W>(
        &mut self,
        sink: &mut W,
        from: SeekFrom,
        max_lines: usize,
    ) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let before = self.reader.stream_position().await?;
        if let Err(e) = self.reader.seek(from).await {
            // A rejected seek must not move the cursor
            self.reader.seek(SeekFrom::Start(before)).await?;
            return Err(e);
        }

        let mut line = Vec::new();
        let mut copied = 0;
        while copied < max_lines {
            line.clear();
            if self.reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            sink.write_all(&line).await?;
            copied += 1;
        }
        sink.flush().await?;

        self.reader.stream_position().await
    }

    /// Copy the last `length` bytes of the file into `sink`, starting at a line boundary.
    ///
    /// When the window starts inside a line, that partial line is skipped, unless it is
    /// the unterminated last line of the file: then it is copied from the window start.
    /// When the file is not longer than `length` the whole file is copied.
    pub async fn tail<W>(&mut self, sink: &mut W, length: u64, max_lines: usize) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let size = self.reader.seek(SeekFrom::End(0)).await?;
        if size <= length {
            return self.read_lines(sink, SeekFrom::Start(0), max_lines).await;
        }

        // Reading from the byte before the window consumes exactly the rest of the
        // line that byte belongs to, which is just the byte itself if it is a newline.
        let start = size - length;
        self.reader.seek(SeekFrom::Start(start - 1)).await?;
        let mut partial = Vec::new();
        self.reader.read_until(b'\n', &mut partial).await?;
        if partial.last() != Some(&b'\n') {
            // No line boundary inside the window
            return self.read_lines(sink, SeekFrom::Start(start), max_lines).await;
        }

        self.read_lines(sink, SeekFrom::Current(0), max_lines).await
    }
}
