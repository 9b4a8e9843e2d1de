//! Sorted chunk files.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::buffer::LineBuffer;

const PLACEHOLDER: &str = "{}";

/// Chunk file path template. The file name must contain a `{}` placeholder
/// which is replaced by the 1-based chunk number, for example `/tmp/sort/{}.chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPathTemplate {
    dir: PathBuf,
    prefix: String,
    suffix: String,
}

impl ChunkPathTemplate {
    /// Parses a template. Returns `None` if the file name is not valid UTF-8 or has no placeholder.
    pub fn parse(template: impl AsRef<Path>) -> Option<Self> {
        let template = template.as_ref();
        let file_name = template.file_name()?.to_str()?;
        let (prefix, suffix) = file_name.split_once(PLACEHOLDER)?;

        Some(ChunkPathTemplate {
            dir: template.parent().map(Path::to_path_buf).unwrap_or_default(),
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        })
    }

    /// Creates a template for files inside a directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        ChunkPathTemplate {
            dir: dir.as_ref().to_path_buf(),
            prefix: "chunk-".to_owned(),
            suffix: ".txt".to_owned(),
        }
    }

    /// Directory the chunk files are placed into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of chunk `number`.
    pub fn path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{}{}{}", self.prefix, number, self.suffix))
    }
}

/// A sorted run stored on the file system.
#[derive(Debug, Clone)]
pub struct ChunkFile {
    /// 1-based chunk number reflecting the chunk's position in the input.
    pub number: u64,
    pub path: PathBuf,
    /// Number of lines in the chunk.
    pub lines: usize,
}

impl ChunkFile {
    /// Writes the lines of a sorted `buffer` in their sorted order to a new chunk file.
    pub fn write(path: PathBuf, number: u64, buffer: &LineBuffer, buf_size: usize) -> io::Result<Self> {
        let mut chunk_writer = io::BufWriter::with_capacity(buf_size, fs::File::create(&path)?);

        let mut lines = 0;
        for index in buffer.sorted_order() {
            buffer.write_line(&mut chunk_writer, index)?;
            lines += 1;
        }
        chunk_writer.flush()?;

        return Ok(ChunkFile { number, path, lines });
    }

    /// Opens the chunk as a stream of lines.
    pub fn open(&self, buf_size: usize) -> io::Result<LineReader<io::BufReader<fs::File>>> {
        let file = fs::File::open(&self.path)?;
        Ok(LineReader::new(io::BufReader::with_capacity(buf_size, file)))
    }

    pub fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Unbounded reader producing one line at a time, terminators excluded.
pub struct LineReader<R> {
    reader: R,
    failed: bool,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        LineReader { reader, failed: false }
    }
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                Some(Ok(line))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
