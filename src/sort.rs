//! External text file sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{self, AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log;

use crate::buffer::{BufferLayout, ChunkReader, LineBuffer};
use crate::chunk::{ChunkFile, ChunkPathTemplate};
use crate::compare::{LineCompare, NumericPrefixComparator};
use crate::memory::{self, MemoryHint, ResidentSetHint};
use crate::merger::{SortedStream, StreamMerger, DEFAULT_QUEUE_CAPACITY};
use crate::pool::BufferPool;

/// Default chunk and output file read/write buffer size.
pub const DEFAULT_RW_BUF_SIZE: usize = 1024 * 1024;

/// Share of the available physical memory the chunk buffers may occupy.
const AVAILABLE_MEMORY_SHARE: f64 = 0.8;
/// Memory budget used when neither a limit is set nor the available memory is known.
const FALLBACK_MEMORY_BUDGET: u64 = 1024 * 1024 * 1024;
/// Merging is I/O bound, more threads don't pay off.
const MERGE_PARALLELISM: usize = 2;
const PROGRESS_LINES: u64 = 1_000_000;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input, chunk or output file I/O error.
    IO(io::Error),
    /// A line doesn't fit into a chunk buffer.
    LineTooLarge { capacity: usize },
    /// Invalid sorter configuration.
    Configuration(String),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::LineTooLarge { .. } => None,
            SortError::Configuration(_) => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::LineTooLarge { capacity } => {
                write!(f, "line length exceeds chunk buffer capacity ({} bytes)", capacity)
            }
            SortError::Configuration(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}

/// Sorting summary.
#[derive(Debug, Clone)]
pub struct SortStats {
    /// Number of chunk files created.
    pub chunks: usize,
    /// Number of lines written to the output.
    pub lines: u64,
    /// Number of bytes read from the input.
    pub bytes_read: u64,
    pub chunks_time: Duration,
    pub merge_time: Duration,
}

/// Text file sorter builder. Provides methods for [`TextFileSorter`] initialization.
pub struct TextFileSorterBuilder<C = NumericPrefixComparator>
where
    C: LineCompare,
{
    /// File to be sorted.
    input: PathBuf,
    /// Result file.
    output: PathBuf,
    /// Chunk files path template.
    chunk_template: Option<PathBuf>,
    /// Directory to be used to store chunks if no template is provided.
    tmp_dir: Option<Box<Path>>,
    /// Chunk buffers memory limit in bytes.
    memory_limit: Option<u64>,
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Fixed chunk memory overriding the memory based one.
    chunk_capacity: Option<usize>,
    /// Capacity of the queues between parallel merge threads.
    merge_queue_capacity: Option<usize>,
    memory_hint: Option<Box<dyn MemoryHint>>,
    comparator: C,
}

impl TextFileSorterBuilder<NumericPrefixComparator> {
    /// Creates an instance of a builder with default parameters.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        TextFileSorterBuilder {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            chunk_template: None,
            tmp_dir: None,
            memory_limit: None,
            threads_number: None,
            rw_buf_size: None,
            chunk_capacity: None,
            merge_queue_capacity: None,
            memory_hint: None,
            comparator: NumericPrefixComparator,
        }
    }
}

impl<C> TextFileSorterBuilder<C>
where
    C: LineCompare,
{
    /// Builds a [`TextFileSorter`] instance using provided configuration.
    pub fn build(self) -> Result<TextFileSorter<C>, SortError> {
        if self.memory_limit == Some(0) {
            return Err(SortError::Configuration("memory limit must be positive".into()));
        }
        if self.threads_number == Some(0) {
            return Err(SortError::Configuration("threads number must be positive".into()));
        }
        if self.chunk_capacity == Some(0) {
            return Err(SortError::Configuration("chunk capacity must be positive".into()));
        }

        let (chunk_template, tmp_dir) = match &self.chunk_template {
            Some(template) => match ChunkPathTemplate::parse(template) {
                Some(template) => (template, None),
                None => {
                    return Err(SortError::Configuration(format!(
                        "chunk file name template {} has no {{}} placeholder",
                        template.display()
                    )))
                }
            },
            None => {
                let tmp_dir = init_tmp_directory(self.tmp_dir.as_deref())?;
                (ChunkPathTemplate::in_dir(tmp_dir.path()), Some(tmp_dir))
            }
        };

        let memory_limit = self.memory_limit;
        return Ok(TextFileSorter {
            input: self.input,
            output: self.output,
            chunk_template,
            tmp_dir,
            thread_pool: init_thread_pool(self.threads_number)?,
            memory_limit,
            rw_buf_size: self.rw_buf_size.unwrap_or(DEFAULT_RW_BUF_SIZE),
            chunk_capacity: self.chunk_capacity,
            merge_queue_capacity: self.merge_queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            memory_hint: self
                .memory_hint
                .unwrap_or_else(|| Box::new(ResidentSetHint::new(memory_limit))),
            comparator: Arc::new(self.comparator),
        });
    }

    /// Sets chunk files path template. The file name must contain a `{}` placeholder to be replaced
    /// by the chunk number, for example `/tmp/sort/{}.chunk`.
    pub fn with_chunk_template(mut self, template: impl AsRef<Path>) -> Self {
        self.chunk_template = Some(template.as_ref().to_path_buf());
        return self;
    }

    /// Sets directory to be used to store chunks if no chunk template is set.
    pub fn with_tmp_dir(mut self, path: &Path) -> Self {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets memory limit for chunk buffers.
    pub fn with_memory_limit(mut self, memory_limit: u64) -> Self {
        self.memory_limit = Some(memory_limit);
        return self;
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> Self {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets chunk and output file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> Self {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets a fixed memory size of a chunk buffer, its line index included, instead of the one derived from
    /// the memory limit.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = Some(capacity);
        return self;
    }

    /// Sets capacity of the queues connecting parallel merge threads.
    pub fn with_merge_queue_capacity(mut self, capacity: usize) -> Self {
        self.merge_queue_capacity = Some(capacity);
        return self;
    }

    /// Sets memory pressure hint.
    pub fn with_memory_hint(mut self, hint: impl MemoryHint + 'static) -> Self {
        self.memory_hint = Some(Box::new(hint));
        return self;
    }

    /// Sets line comparator.
    pub fn with_comparator<D: LineCompare>(self, comparator: D) -> TextFileSorterBuilder<D> {
        TextFileSorterBuilder {
            input: self.input,
            output: self.output,
            chunk_template: self.chunk_template,
            tmp_dir: self.tmp_dir,
            memory_limit: self.memory_limit,
            threads_number: self.threads_number,
            rw_buf_size: self.rw_buf_size,
            chunk_capacity: self.chunk_capacity,
            merge_queue_capacity: self.merge_queue_capacity,
            memory_hint: self.memory_hint,
            comparator,
        }
    }
}

fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
    let mut thread_pool_builder = rayon::ThreadPoolBuilder::new().thread_name(|idx| format!("chunk-sort-{}", idx));

    if let Some(threads_number) = threads_number {
        log::info!("initializing thread-pool (threads: {})", threads_number);
        thread_pool_builder = thread_pool_builder.num_threads(threads_number);
    } else {
        log::info!("initializing thread-pool (threads: default)");
    }
    let thread_pool = thread_pool_builder
        .build()
        .map_err(|err| SortError::ThreadPoolBuildError(err))?;

    return Ok(thread_pool);
}

fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
    let tmp_dir = if let Some(tmp_path) = tmp_path {
        tempfile::tempdir_in(tmp_path)
    } else {
        tempfile::tempdir()
    }
    .map_err(|err| SortError::TempDir(err))?;

    log::info!("using {} as a temporary directory", tmp_dir.path().display());

    return Ok(tmp_dir);
}

/// Input shared by chunk workers.
struct ChunkSource<R> {
    reader: ChunkReader<R>,
    next_number: u64,
}

/// State shared by chunk workers.
struct ChunkJob<'a, R> {
    source: &'a Mutex<ChunkSource<R>>,
    pool: &'a BufferPool,
    failed: &'a AtomicBool,
    processed: &'a AtomicU64,
    input_len: Option<u64>,
}

/// External text file sorter.
///
/// Sorts the lines of the input file writing the result to the output file. The input is split into
/// chunks fitting into memory, each chunk is sorted and stored to a chunk file, then the chunk files
/// are merged.
pub struct TextFileSorter<C = NumericPrefixComparator>
where
    C: LineCompare,
{
    input: PathBuf,
    output: PathBuf,
    chunk_template: ChunkPathTemplate,
    /// Keeps the default chunk directory alive, it is removed on drop.
    tmp_dir: Option<tempfile::TempDir>,
    /// Chunk sorting thread pool.
    thread_pool: rayon::ThreadPool,
    memory_limit: Option<u64>,
    rw_buf_size: usize,
    chunk_capacity: Option<usize>,
    merge_queue_capacity: usize,
    memory_hint: Box<dyn MemoryHint>,
    comparator: Arc<C>,
}

impl<C> TextFileSorter<C>
where
    C: LineCompare,
{
    /// Number of chunks sorted in parallel.
    pub fn parallelism(&self) -> usize {
        self.thread_pool.current_num_threads()
    }

    /// Directory the chunk files are stored in.
    pub fn chunk_dir(&self) -> &Path {
        match &self.tmp_dir {
            Some(tmp_dir) => tmp_dir.path(),
            None => self.chunk_template.dir(),
        }
    }

    /// Sorts the input file.
    pub fn sort(&self) -> Result<SortStats, SortError> {
        self.create_directories()?;

        let started = Instant::now();
        let (chunks, bytes_read) = self.sort_chunks()?;
        let chunks_time = started.elapsed();
        log::info!(
            "sorting chunks done in {:.3} s ({} chunks)",
            chunks_time.as_secs_f64(),
            chunks.len()
        );

        let started = Instant::now();
        let lines = self.merge_chunks(&chunks)?;
        let merge_time = started.elapsed();
        log::info!("merging chunks done in {:.3} s ({} lines)", merge_time.as_secs_f64(), lines);

        self.remove_chunks(&chunks)?;

        return Ok(SortStats {
            chunks: chunks.len(),
            lines,
            bytes_read,
            chunks_time,
            merge_time,
        });
    }

    fn create_directories(&self) -> Result<(), SortError> {
        let chunk_dir = self.chunk_template.dir();
        let output_dir = self.output.parent().unwrap_or_else(|| Path::new(""));

        for dir in [chunk_dir, output_dir] {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                log::debug!("creating directory {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }

        return Ok(());
    }

    /// Computes the chunk buffer layout. The memory of a chunk covers both its data and its line index.
    fn chunk_layout(&self, input_len: Option<u64>) -> Result<BufferLayout, SortError> {
        let parallelism = self.parallelism() as u64;
        let chunk_memory = match self.chunk_capacity {
            Some(capacity) => capacity as u64,
            None => self.memory_budget() / parallelism,
        };
        let chunk_memory = usize::try_from(chunk_memory).unwrap_or(usize::MAX);

        let layout = match BufferLayout::for_memory(chunk_memory) {
            Some(layout) => layout,
            None => {
                return Err(SortError::Configuration(format!(
                    "chunk memory of {} bytes is too small for {} threads",
                    chunk_memory, parallelism
                )))
            }
        };

        return Ok(match input_len {
            // one extra byte lets a single chunk take the whole input
            Some(input_len) => layout.clip(usize::try_from(input_len.saturating_add(1)).unwrap_or(usize::MAX)),
            None => layout,
        });
    }

    fn memory_budget(&self) -> u64 {
        let available = memory::available_memory().map(|available| (available as f64 * AVAILABLE_MEMORY_SHARE) as u64);

        match (available, self.memory_limit) {
            (Some(available), Some(limit)) => available.min(limit),
            (Some(available), None) => available,
            (None, Some(limit)) => limit,
            (None, None) => {
                log::warn!(
                    "available memory is unknown, using {} bytes memory budget",
                    FALLBACK_MEMORY_BUDGET
                );
                FALLBACK_MEMORY_BUDGET
            }
        }
    }

    fn sort_chunks(&self) -> Result<(Vec<ChunkFile>, u64), SortError> {
        let input = fs::File::open(&self.input)?;
        let metadata = input.metadata()?;
        let input_len = metadata.is_file().then(|| metadata.len());

        let layout = self.chunk_layout(input_len)?;
        log::info!(
            "sorting chunks of {} (chunk capacity: {} bytes, {} lines, threads: {})",
            self.input.display(),
            layout.capacity,
            layout.max_lines,
            self.parallelism()
        );

        let pool = BufferPool::new(layout, self.parallelism());
        let source = Mutex::new(ChunkSource {
            reader: ChunkReader::new(io::BufReader::with_capacity(self.rw_buf_size, input)),
            next_number: 1,
        });
        let failed = AtomicBool::new(false);
        let processed = AtomicU64::new(0);

        let job = ChunkJob {
            source: &source,
            pool: &pool,
            failed: &failed,
            processed: &processed,
            input_len,
        };

        let results = self.thread_pool.broadcast(|_| {
            let mut worker_chunks = Vec::new();
            let result = self.run_chunk_worker(&job, &mut worker_chunks);
            if result.is_err() {
                failed.store(true, atomic::Ordering::Release);
            }
            (worker_chunks, result)
        });

        let mut chunks = Vec::new();
        let mut first_error = None;
        for (worker_chunks, result) in results {
            chunks.extend(worker_chunks);
            if let Err(err) = result {
                log::error!("chunk sorting failed: {}", err);
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            for chunk in &chunks {
                let _ = chunk.remove();
            }
            return Err(err);
        }

        if self.memory_hint.reclaim(true) {
            log::debug!("released {} idle chunk buffers", pool.shrink());
        }

        chunks.sort_by_key(|chunk| chunk.number);
        let bytes_read = source.into_inner().unwrap_or_else(PoisonError::into_inner).reader.bytes_read();

        return Ok((chunks, bytes_read));
    }

    fn run_chunk_worker<R: BufRead>(&self, job: &ChunkJob<'_, R>, chunks: &mut Vec<ChunkFile>) -> Result<(), SortError> {
        while !job.failed.load(atomic::Ordering::Acquire) {
            let mut buffer = job.pool.acquire();

            let (number, bytes) = {
                let mut source = job.source.lock().unwrap_or_else(PoisonError::into_inner);
                let bytes_before = source.reader.bytes_read();
                if !source.reader.fill(&mut buffer)? {
                    job.pool.release(buffer);
                    break;
                }

                let number = source.next_number;
                source.next_number += 1;
                (number, source.reader.bytes_read() - bytes_before)
            };

            let chunk = self.sort_chunk(&mut buffer, number)?;
            let line_count = buffer.line_count();
            job.pool.release(buffer);

            let processed = job.processed.fetch_add(bytes, atomic::Ordering::AcqRel) + bytes;
            match job.input_len {
                Some(input_len) => log::info!(
                    "processed chunk {} of size {} with {} lines, total progress: {}/{} ({} %)",
                    number,
                    bytes,
                    line_count,
                    processed,
                    input_len,
                    processed * 100 / input_len.max(1)
                ),
                None => log::info!(
                    "processed chunk {} of size {} with {} lines, total progress: {}",
                    number,
                    bytes,
                    line_count,
                    processed
                ),
            }

            if self.memory_hint.reclaim(false) {
                log::debug!("released {} idle chunk buffers", job.pool.shrink());
            }

            chunks.push(chunk);
        }

        return Ok(());
    }

    fn sort_chunk(&self, buffer: &mut LineBuffer, number: u64) -> Result<ChunkFile, SortError> {
        log::debug!("sorting chunk {} ...", number);
        let started = Instant::now();

        buffer.sort_lines(self.comparator.as_ref());
        log::debug!("chunk {} sorted in {:.3} s", number, started.elapsed().as_secs_f64());

        let path = self.chunk_template.path(number);
        log::debug!("saving chunk {} to {}", number, path.display());
        let chunk = ChunkFile::write(path, number, buffer, self.rw_buf_size)?;

        return Ok(chunk);
    }

    fn merge_chunks(&self, chunks: &[ChunkFile]) -> Result<u64, SortError> {
        log::info!("merging {} chunks ...", chunks.len());

        match chunks {
            [] => {
                fs::File::create(&self.output)?;
                return Ok(0);
            }
            [chunk] => {
                self.move_to_output(&chunk.path)?;
                return Ok(chunk.lines as u64);
            }
            _ => {}
        }

        let mut bytes_total = 0;
        let mut streams: Vec<SortedStream<Vec<u8>, io::Error>> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            bytes_total += fs::metadata(&chunk.path)?.len();
            streams.push(Box::new(chunk.open(self.rw_buf_size)?));
        }

        let comparator = Arc::clone(&self.comparator);
        let merger = StreamMerger::new(
            move |a: &Vec<u8>, b: &Vec<u8>| comparator.compare(a, b),
            MERGE_PARALLELISM.min(self.parallelism()),
        )
        .with_queue_capacity(self.merge_queue_capacity);
        let merged = merger.merge(streams)?;

        let mut output_writer = io::BufWriter::with_capacity(self.rw_buf_size, fs::File::create(&self.output)?);
        let mut lines: u64 = 0;
        let mut bytes_written: u64 = 0;
        for line in merged {
            let line = line?;
            output_writer.write_all(&line)?;
            output_writer.write_all(b"\r\n")?;

            lines += 1;
            bytes_written += line.len() as u64 + 2;
            if lines % PROGRESS_LINES == 0 {
                log::info!(
                    "merged {} lines, total progress: {}/{} ({} %)",
                    lines,
                    bytes_written,
                    bytes_total,
                    bytes_written * 100 / bytes_total.max(1)
                );
            }
        }
        output_writer.flush()?;

        return Ok(lines);
    }

    fn move_to_output(&self, chunk_path: &Path) -> Result<(), SortError> {
        log::debug!("moving {} to {}", chunk_path.display(), self.output.display());

        if let Err(err) = fs::rename(chunk_path, &self.output) {
            log::debug!("chunk renaming failed ({}), copying it instead", err);
            fs::copy(chunk_path, &self.output)?;
            fs::remove_file(chunk_path)?;
        }

        return Ok(());
    }

    fn remove_chunks(&self, chunks: &[ChunkFile]) -> Result<(), SortError> {
        for chunk in chunks {
            match chunk.remove() {
                Ok(()) => {}
                // the single chunk is moved to the output
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(SortError::IO(err)),
            }
        }

        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;
    use std::fs;
    use std::path::{Path, PathBuf};

    use rand::prelude::*;
    use rstest::*;

    use super::{SortError, TextFileSorterBuilder};
    use crate::buffer::BufferLayout;
    use crate::compare::{LineCompare, NumericPrefixComparator};
    use crate::memory::NoMemoryHint;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn random_lines(count: usize, rng: &mut impl Rng) -> Vec<String> {
        const WORDS: [&str; 8] = ["Apple", "Banana", "Cherry", "Apple is red", "Something", "B", "", "Zebra zone"];

        (0..count)
            .map(|_| format!("{}. {}", rng.gen_range(0..100), WORDS.choose(rng).unwrap()))
            .collect()
    }

    fn write_input(dir: &Path, lines: &[String]) -> PathBuf {
        let path = dir.join("input.txt");
        let content: String = lines.iter().map(|line| format!("{}\n", line)).collect();
        fs::write(&path, content).unwrap();
        path
    }

    fn read_output(path: &Path) -> Vec<String> {
        fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    fn sorted(lines: &[String]) -> Vec<String> {
        let mut lines = lines.to_vec();
        lines.sort_by(|a, b| NumericPrefixComparator.compare(a.as_bytes(), b.as_bytes()));
        lines
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut entries: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        entries
    }

    #[rstest]
    #[case(256, 1)]
    #[case(256, 4)]
    #[case(400, 2)]
    #[case(1000, 3)]
    #[case(4096, 8)]
    fn test_text_file_sorter(tmp_dir: tempfile::TempDir, #[case] chunk_capacity: usize, #[case] threads: usize) {
        let lines = random_lines(2000, &mut rand::thread_rng());
        let input = write_input(tmp_dir.path(), &lines);
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_chunk_template(tmp_dir.path().join("chunks").join("{}.chunk"))
            .with_chunk_capacity(chunk_capacity)
            .with_threads_number(threads)
            .with_merge_queue_capacity(16)
            .build()
            .unwrap();

        let stats = sorter.sort().unwrap();

        assert!(stats.chunks > 1);
        assert_eq!(stats.lines, lines.len() as u64);
        assert_eq!(stats.bytes_read, fs::metadata(&input).unwrap().len());

        let actual_result = read_output(&output);
        for window in actual_result.windows(2) {
            assert_ne!(
                NumericPrefixComparator.compare(window[0].as_bytes(), window[1].as_bytes()),
                Ordering::Greater
            );
        }
        assert_eq!(actual_result, sorted(&lines));

        let content = fs::read(&output).unwrap();
        assert!(content.ends_with(b"\r\n"));
        assert_eq!(content.iter().filter(|&&c| c == b'\r').count(), lines.len());

        assert!(dir_entries(&tmp_dir.path().join("chunks")).is_empty());
    }

    #[rstest]
    fn test_single_chunk_shortcut(tmp_dir: tempfile::TempDir) {
        let lines: Vec<String> = vec!["12. abc".into(), "5. abc".into(), "2. abc".into(), "1. ab".into()];
        let input = write_input(tmp_dir.path(), &lines);
        let output = tmp_dir.path().join("sorted").join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_chunk_template(tmp_dir.path().join("chunk_{}.txt"))
            .with_memory_limit(1024 * 1024)
            .with_threads_number(2)
            .build()
            .unwrap();

        let stats = sorter.sort().unwrap();

        assert_eq!(stats.chunks, 1);
        assert_eq!(fs::read_to_string(&output).unwrap(), "1. ab\n2. abc\n5. abc\n12. abc\n");
        assert_eq!(dir_entries(tmp_dir.path()), vec!["input.txt", "sorted"]);
    }

    #[rstest]
    #[case(1024 * 1024, "1. a\n2. b\n3. c\n")]
    #[case(40, "1. a\r\n2. b\r\n3. c\r\n")]
    fn test_sorted_input(tmp_dir: tempfile::TempDir, #[case] chunk_capacity: usize, #[case] expected: &str) {
        let lines: Vec<String> = vec!["1. a".into(), "2. b".into(), "3. c".into()];
        let input = write_input(tmp_dir.path(), &lines);
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_chunk_capacity(chunk_capacity)
            .with_threads_number(2)
            .build()
            .unwrap();
        sorter.sort().unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), expected);
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        fs::write(&input, "").unwrap();
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output).build().unwrap();
        let stats = sorter.sort().unwrap();

        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.lines, 0);
        assert_eq!(fs::read(&output).unwrap(), b"");
    }

    #[rstest]
    fn test_unterminated_last_line(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        fs::write(&input, "3. c\r\n1. a\r\n2. b").unwrap();
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_chunk_capacity(40)
            .with_threads_number(2)
            .build()
            .unwrap();
        let stats = sorter.sort().unwrap();

        assert_eq!(stats.lines, 3);
        assert_eq!(fs::read_to_string(&output).unwrap(), "1. a\r\n2. b\r\n3. c\r\n");
    }

    #[rstest]
    fn test_memory_limited_sort(tmp_dir: tempfile::TempDir) {
        let lines = random_lines(10_000, &mut rand::thread_rng());
        let input = write_input(tmp_dir.path(), &lines);
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_tmp_dir(tmp_dir.path())
            .with_memory_limit(16 * 1024)
            .with_threads_number(2)
            .with_memory_hint(NoMemoryHint)
            .build()
            .unwrap();

        let stats = sorter.sort().unwrap();

        assert!(stats.chunks > 1);
        assert_eq!(read_output(&output), sorted(&lines));
    }

    #[rstest]
    fn test_custom_comparator(tmp_dir: tempfile::TempDir) {
        let lines = random_lines(500, &mut rand::thread_rng());
        let input = write_input(tmp_dir.path(), &lines);
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_comparator(|a: &[u8], b: &[u8]| b.cmp(a))
            .with_chunk_capacity(256)
            .with_threads_number(3)
            .build()
            .unwrap();
        sorter.sort().unwrap();

        let mut expected_result = lines.clone();
        expected_result.sort_by(|a, b| b.cmp(a));
        assert_eq!(read_output(&output), expected_result);
    }

    #[rstest]
    fn test_stale_chunks_ignored(tmp_dir: tempfile::TempDir) {
        let lines = random_lines(300, &mut rand::thread_rng());
        let input = write_input(tmp_dir.path(), &lines);
        let output = tmp_dir.path().join("output.txt");
        let stale_chunk = tmp_dir.path().join("999.chunk");
        fs::write(&stale_chunk, "0. stale\n").unwrap();

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_chunk_template(tmp_dir.path().join("{}.chunk"))
            .with_chunk_capacity(128)
            .with_threads_number(2)
            .build()
            .unwrap();
        sorter.sort().unwrap();

        assert_eq!(read_output(&output), sorted(&lines));
        assert!(stale_chunk.exists());
    }

    #[rstest]
    #[case("1. a\n2. this line is far too long for a small chunk\n3. c\n", 40)]
    #[case("this line is far too long for a small chunk", 40)]
    fn test_line_too_large(tmp_dir: tempfile::TempDir, #[case] content: &str, #[case] chunk_capacity: usize) {
        let input = tmp_dir.path().join("input.txt");
        fs::write(&input, content).unwrap();
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_chunk_template(tmp_dir.path().join("chunks").join("{}"))
            .with_chunk_capacity(chunk_capacity)
            .with_threads_number(2)
            .build()
            .unwrap();

        match sorter.sort() {
            Err(SortError::LineTooLarge { capacity }) => {
                assert_eq!(capacity, BufferLayout::for_memory(chunk_capacity).unwrap().capacity)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!output.exists());
        assert!(dir_entries(&tmp_dir.path().join("chunks")).is_empty());
    }

    #[rstest]
    #[case(1024 * 1024, 4, None)]
    #[case(1024 * 1024, 3, Some(10_000))]
    #[case(16 * 1024 * 1024, 8, Some(100))]
    fn test_chunk_layout_within_budget(
        tmp_dir: tempfile::TempDir,
        #[case] memory_limit: u64,
        #[case] threads: usize,
        #[case] input_len: Option<u64>,
    ) {
        let sorter = TextFileSorterBuilder::new(tmp_dir.path().join("input.txt"), tmp_dir.path().join("output.txt"))
            .with_threads_number(threads)
            .with_memory_limit(memory_limit)
            .build()
            .unwrap();

        let layout = sorter.chunk_layout(input_len).unwrap();
        let chunk_memory = memory_limit / threads as u64;

        assert!(layout.memory_size() as u64 <= chunk_memory);
        assert!(layout.max_lines >= 1);
        if let Some(input_len) = input_len {
            assert!(layout.capacity as u64 <= input_len + 1);
        }
    }

    #[rstest]
    fn test_chunk_capacity_too_small(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        fs::write(&input, "1. a\n").unwrap();

        let sorter = TextFileSorterBuilder::new(&input, tmp_dir.path().join("output.txt"))
            .with_chunk_capacity(8)
            .build()
            .unwrap();

        assert!(matches!(sorter.sort(), Err(SortError::Configuration(_))));
    }

    #[rstest]
    fn test_missing_input(tmp_dir: tempfile::TempDir) {
        let sorter = TextFileSorterBuilder::new(tmp_dir.path().join("missing.txt"), tmp_dir.path().join("output.txt"))
            .build()
            .unwrap();

        assert!(matches!(sorter.sort(), Err(SortError::IO(_))));
    }

    #[rstest]
    fn test_invalid_configuration(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");

        let results = [
            TextFileSorterBuilder::new(&input, &output).with_memory_limit(0).build(),
            TextFileSorterBuilder::new(&input, &output).with_threads_number(0).build(),
            TextFileSorterBuilder::new(&input, &output).with_chunk_capacity(0).build(),
            TextFileSorterBuilder::new(&input, &output)
                .with_chunk_template(tmp_dir.path().join("chunk.txt"))
                .build(),
        ];

        for result in results {
            assert!(matches!(result, Err(SortError::Configuration(_))));
        }
    }

    #[rstest]
    fn test_default_chunk_dir_removed(tmp_dir: tempfile::TempDir) {
        let input = write_input(tmp_dir.path(), &["1. a".to_string()]);
        let output = tmp_dir.path().join("output.txt");

        let sorter = TextFileSorterBuilder::new(&input, &output)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        let chunk_dir = sorter.chunk_dir().to_path_buf();
        assert!(chunk_dir.starts_with(tmp_dir.path()));

        sorter.sort().unwrap();
        drop(sorter);

        assert!(!chunk_dir.exists());
    }
}
