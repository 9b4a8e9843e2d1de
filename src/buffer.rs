//! Line indexed chunk buffer and its stream reader.

use std::cmp::Ordering;
use std::io;
use std::io::prelude::*;
use std::mem;
use std::ptr;

use memchr;

use crate::compare::LineCompare;
use crate::sort::SortError;

/// Index memory per line: the terminator offset and the sort permutation slot.
pub const INDEX_ENTRY_SIZE: usize = 2 * mem::size_of::<u32>();
/// Average line length the line index is sized for. Shorter lines end a fill before the data is full.
pub const INDEXED_LINE_LENGTH: usize = 24;
/// Offsets are stored as `u32`.
pub const MAX_BUFFER_CAPACITY: usize = u32::MAX as usize;
/// Maximum number of bytes requested from the stream at once. Reading stops as soon as the line index
/// is full, so at most this much input is carried over to the next fill.
const READ_STEP: usize = 64 * 1024;

/// Memory layout of a [`LineBuffer`]: data capacity and the number of line index slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub capacity: usize,
    pub max_lines: usize,
}

impl BufferLayout {
    /// Splits `memory` bytes between line data and the line index.
    /// Returns `None` if no data byte is left.
    pub fn for_memory(memory: usize) -> Option<Self> {
        let max_lines = (memory / (INDEXED_LINE_LENGTH + INDEX_ENTRY_SIZE)).max(1);
        let capacity = memory
            .checked_sub(max_lines * INDEX_ENTRY_SIZE)?
            .min(MAX_BUFFER_CAPACITY);
        if capacity == 0 {
            return None;
        }

        Some(BufferLayout {
            capacity,
            max_lines: max_lines.min(capacity),
        })
    }

    /// Shrinks the layout to hold at most `len` data bytes.
    pub fn clip(self, len: usize) -> Self {
        let capacity = self.capacity.min(len.max(1));
        BufferLayout {
            capacity,
            max_lines: self.max_lines.min(capacity),
        }
    }

    /// Total memory of a buffer with this layout in bytes.
    pub fn memory_size(&self) -> usize {
        self.capacity + self.max_lines * INDEX_ENTRY_SIZE
    }
}

/// Fixed-capacity byte buffer holding complete lines together with the offsets of their terminators.
///
/// Line `i` spans `[line_ends[i - 1] + 1, line_ends[i])` (starting at 0 for the first line). A carriage
/// return right before a terminator belongs to the terminator and is not part of the line. The line
/// index and the sort permutation are allocated once and never grow.
pub struct LineBuffer {
    data: Box<[u8]>,
    len: usize,
    line_ends: Vec<u32>,
    order: Vec<u32>,
    max_lines: usize,
}

impl LineBuffer {
    /// Creates an empty buffer able to hold `capacity` bytes with an index slot for every byte.
    pub fn new(capacity: usize) -> Self {
        Self::with_layout(BufferLayout {
            capacity,
            max_lines: capacity,
        })
    }

    /// Creates an empty buffer with the given layout.
    ///
    /// # Panics
    ///
    /// Panics if the capacity exceeds [`MAX_BUFFER_CAPACITY`].
    pub fn with_layout(layout: BufferLayout) -> Self {
        assert!(layout.capacity <= MAX_BUFFER_CAPACITY, "buffer capacity exceeds u32 offsets");

        let max_lines = layout.max_lines.max(1);
        LineBuffer {
            data: vec![0; layout.capacity].into_boxed_slice(),
            len: 0,
            line_ends: Vec::with_capacity(max_lines),
            order: Vec::with_capacity(max_lines),
            max_lines,
        }
    }

    pub fn layout(&self) -> BufferLayout {
        BufferLayout {
            capacity: self.data.len(),
            max_lines: self.max_lines,
        }
    }

    /// Returns buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the memory held by the buffer data and its index in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() + (self.line_ends.capacity() + self.order.capacity()) * mem::size_of::<u32>()
    }

    /// Returns the number of bytes occupied by complete lines.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of lines loaded into the buffer.
    pub fn line_count(&self) -> usize {
        self.line_ends.len()
    }

    /// Returns the content of line `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn line(&self, index: usize) -> &[u8] {
        let start = if index == 0 { 0 } else { self.line_ends[index - 1] as usize + 1 };
        let mut end = self.line_ends[index] as usize;
        if end > start && end < self.len && self.data[end - 1] == b'\r' {
            end -= 1;
        }

        &self.data[start..end]
    }

    /// Returns a reference to line `index`.
    pub fn line_ref(&self, index: usize) -> LineRef<'_> {
        LineRef { buffer: self, index }
    }

    /// Returns an iterator over loaded lines in their input order.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.line_count()).map(move |index| self.line(index))
    }

    /// Sorts the line permutation using a comparator. Line data is not moved.
    pub fn sort_lines<C: LineCompare + ?Sized>(&mut self, comparator: &C) {
        let mut order = mem::take(&mut self.order);
        order.clear();
        order.extend(0..self.line_ends.len() as u32);
        order.sort_unstable_by(|&a, &b| {
            self.line_ref(a as usize)
                .cmp_by(&self.line_ref(b as usize), comparator)
        });
        self.order = order;
    }

    /// Returns the line indices in sorted order, empty until [`LineBuffer::sort_lines`] is called.
    pub fn sorted_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().map(|&index| index as usize)
    }

    /// Writes line `index` followed by a single line terminator.
    pub fn write_line(&self, sink: &mut impl Write, index: usize) -> io::Result<()> {
        sink.write_all(self.line(index))?;
        sink.write_all(b"\n")
    }

    fn clear(&mut self) {
        self.len = 0;
        self.line_ends.clear();
        self.order.clear();
    }

    fn is_index_full(&self) -> bool {
        self.line_ends.len() >= self.max_lines
    }

    /// Indexes terminators within `data[from..to]` until the index is full.
    fn index_lines(&mut self, from: usize, to: usize) {
        for position in memchr::memchr_iter(b'\n', &self.data[from..to]) {
            if self.is_index_full() {
                break;
            }
            self.line_ends.push((from + position) as u32);
        }
    }
}

/// Non-owning reference to a single line of a [`LineBuffer`].
#[derive(Clone, Copy)]
pub struct LineRef<'a> {
    buffer: &'a LineBuffer,
    index: usize,
}

impl<'a> LineRef<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buffer.line(self.index)
    }

    /// Compares two lines using a comparator.
    /// References to the same line are equal without the content being compared.
    pub fn cmp_by<C: LineCompare + ?Sized>(&self, other: &LineRef<'_>, comparator: &C) -> Ordering {
        if self.index == other.index && ptr::eq(self.buffer, other.buffer) {
            return Ordering::Equal;
        }

        comparator.compare(self.as_bytes(), other.as_bytes())
    }
}

impl PartialEq for LineRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && ptr::eq(self.buffer, other.buffer)
    }
}

impl Eq for LineRef<'_> {}

impl std::fmt::Debug for LineRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LineRef({}, {:?})", self.index, String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Fills [`LineBuffer`]s from a stream so that no line is ever split between two buffers.
///
/// The bytes following the last indexed line of a fill are carried over and prepended to the next fill.
/// An unterminated line at the end of the stream is loaded as the last line.
pub struct ChunkReader<R> {
    inner: R,
    fragment: Vec<u8>,
    bytes_read: u64,
}

impl<R: BufRead> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkReader {
            inner,
            fragment: Vec::new(),
            bytes_read: 0,
        }
    }

    /// Returns the number of bytes consumed from the underlying stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Loads the next portion of complete lines into `target`.
    /// Returns `false` if the stream is exhausted and nothing was loaded.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::LineTooLarge`] if a line doesn't fit into the buffer.
    pub fn fill(&mut self, target: &mut LineBuffer) -> Result<bool, SortError> {
        target.clear();

        let capacity = target.capacity();
        let mut filled = self.fragment.len();
        target.data[..filled].copy_from_slice(&self.fragment);
        self.fragment.clear();
        target.index_lines(0, filled);

        while filled < capacity && !target.is_index_full() {
            let step_end = capacity.min(filled + READ_STEP);
            match self.inner.read(&mut target.data[filled..step_end]) {
                Ok(0) => break,
                Ok(n) => {
                    target.index_lines(filled, filled + n);
                    filled += n;
                    self.bytes_read += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(SortError::IO(err)),
            }
        }

        let eof = self.at_eof()?;
        if target.line_ends.is_empty() && !eof {
            return Err(SortError::LineTooLarge { capacity });
        }

        let tail_start = target.line_ends.last().map_or(0, |&end| end as usize + 1);
        let mut usable = filled;
        if tail_start < filled {
            if eof && !target.is_index_full() {
                // the stream ended without a terminator, the rest is the last line
                target.line_ends.push(filled as u32);
            } else {
                self.fragment.extend_from_slice(&target.data[tail_start..filled]);
                usable = tail_start;
            }
        }

        target.len = usable;

        return Ok(usable > 0);
    }

    fn at_eof(&mut self) -> Result<bool, SortError> {
        loop {
            match self.inner.fill_buf() {
                Ok(buf) => return Ok(buf.is_empty()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(SortError::IO(err)),
            }
        }
    }
}
