use std::path::PathBuf;
use std::process;

use bytesize::ByteSize;
use env_logger;
use log;

use ext_line_sort::{LineCompare, NumericPrefixComparator, TextFileSorterBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level = *arg_parser.get_one::<LogLevel>("log_level").expect("value has default");
    init_logger(log_level);

    let input = arg_parser.get_one::<PathBuf>("input").expect("value is required");
    let output = arg_parser.get_one::<PathBuf>("output").expect("value is required");

    let mut sorter_builder = TextFileSorterBuilder::new(input, output);
    if let Some(template) = arg_parser.get_one::<PathBuf>("chunks") {
        sorter_builder = sorter_builder.with_chunk_template(template);
    }

    if let Some(tmp_dir) = arg_parser.get_one::<PathBuf>("tmp_dir") {
        sorter_builder = sorter_builder.with_tmp_dir(tmp_dir);
    }

    if let Some(threads) = arg_parser.get_one::<usize>("threads") {
        sorter_builder = sorter_builder.with_threads_number(*threads);
    }

    if let Some(memory_limit) = arg_parser.get_one::<ByteSize>("memory_limit") {
        sorter_builder = sorter_builder.with_memory_limit(memory_limit.as_u64());
    }

    match arg_parser.get_one::<Order>("sort").expect("value has default") {
        Order::Asc => run(sorter_builder),
        Order::Desc => run(sorter_builder.with_comparator(|a: &[u8], b: &[u8]| {
            NumericPrefixComparator.compare(a, b).reverse()
        })),
    }
}

fn run<C: LineCompare>(sorter_builder: TextFileSorterBuilder<C>) {
    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.sort() {
        Ok(stats) => log::info!(
            "sorted {} lines ({} bytes) in {:.3} s using {} chunks",
            stats.lines,
            stats.bytes_read,
            (stats.chunks_time + stats.merge_time).as_secs_f64(),
            stats.chunks
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum Order {
    Asc,
    Desc,
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::Command::new("ext-line-sort")
        .about("external sorter of large text files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::Arg::new("chunks")
                .short('c')
                .long("chunks")
                .help("chunk file path template, {} is replaced by the chunk number")
                .takes_value(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::Arg::new("memory_limit")
                .short('m')
                .long("memory-limit")
                .help("chunk buffers memory limit, for example 512MiB")
                .takes_value(true)
                .value_parser(clap::value_parser!(ByteSize)),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .value_parser(clap::value_parser!(Order)),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .value_parser(clap::value_parser!(LogLevel)),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunk sorting")
                .takes_value(true)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store chunks if no chunk template is set")
                .takes_value(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
