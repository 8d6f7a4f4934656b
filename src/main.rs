#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![allow(clippy::enum_variant_names, clippy::type_complexity)]

use std::process::ExitCode;

mod cli;
mod load;
mod mem_repos;
mod params_file;
mod ra;
mod svn;
mod term_out;

use term_out::ProgressPrint;

type FHashMap<K, V> = std::collections::HashMap<K, V, foldhash::fast::RandomState>;

enum RunError {
    Generic,
    Usage,
}

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Generic) => ExitCode::from(1),
        Err(RunError::Usage) => ExitCode::from(2),
    }
}

fn main_inner() -> Result<(), RunError> {
    let start = std::time::Instant::now();

    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if e.use_stderr() {
                eprintln!("{e}");
                return Err(RunError::Usage);
            }
            // --help and --version
            print!("{e}");
            return Ok(());
        }
    };

    let params = match args.params {
        None => params_file::LoadParams::default(),
        Some(ref params_path) => {
            let params_raw = match std::fs::read_to_string(params_path) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("failed to read {params_path:?}: {e}");
                    return Err(RunError::Generic);
                }
            };
            match toml::from_str(&params_raw) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("failed to parse {params_path:?}: {e}");
                    return Err(RunError::Generic);
                }
            }
        }
    };

    let term_out = term_out::init(start, !args.no_progress);
    let progress_print = term_out.get_progress_print();

    let stderr_log_level = args
        .stderr_log_level
        .unwrap_or(cli::LogLevel::Warn)
        .to_log_level_filter();
    let file_log_level = args.file_log_level.map(cli::LogLevel::to_log_level_filter);

    if let Err(e) = init_logger(
        Some(stderr_log_level),
        args.log_file.as_deref(),
        file_log_level,
        progress_print.clone(),
    ) {
        term_out.finish();
        eprintln!("failed to initialize logging: {e}");
        return Err(RunError::Generic);
    }

    let r = run(&args, &params, &progress_print);

    term_out.finish();

    r
}

fn run(
    args: &cli::Cli,
    params: &params_file::LoadParams,
    progress_print: &ProgressPrint,
) -> Result<(), RunError> {
    let mut source = svn::source::DumpSource::open(&args.src).map_err(|e| {
        tracing::error!("{e}");
        RunError::Generic
    })?;
    if source.compression() != svn::source::Compression::None {
        tracing::debug!("reading {:?} compressed dump", source.compression());
    }

    let mut reader = svn::dump::DumpReader::new(source.stream()).map_err(|e| {
        tracing::error!("failed to read dump header from {:?}: {e}", args.src);
        RunError::Generic
    })?;
    tracing::debug!("dump format version {:?}", reader.version());

    let mut repos = mem_repos::MemRepos::new(&params.root_url);
    repos.set_atomic_revprops(params.atomic_revprops);
    let options = params.to_options();

    progress_print.set_progress("loading".into());
    let mut notify = |rev: u32| {
        println!("* Loaded revision {rev}.");
        progress_print.set_progress(format!("loaded r{rev}"));
    };
    // Nothing interrupts the load from the command line.
    let cancel = || false;

    let r = load::load_dumpstream(&mut reader, &mut repos, &options, &mut notify, &cancel);
    progress_print.freeze_progress();
    if let Err(e) = r {
        tracing::error!("{e}");
        return Err(RunError::Generic);
    }

    tracing::info!("repository is at r{}", repos.head());

    if let Some(ref export_path) = args.export {
        repos.export_head(export_path).map_err(|e| {
            tracing::error!("failed to export to {export_path:?}: {e}");
            RunError::Generic
        })?;
    }

    Ok(())
}

fn init_logger(
    stderr_level: Option<tracing::Level>,
    file_path: Option<&std::path::Path>,
    file_level: Option<tracing::Level>,
    progress_print: ProgressPrint,
) -> Result<(), std::io::Error> {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let stderr_sub = stderr_level.map(|stderr_level| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .without_time()
            .with_writer(MakeLogPrinter { progress_print })
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                stderr_level,
            ))
    });

    let file_sub = match file_path {
        Some(file_path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file)
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        file_level.unwrap_or(tracing::Level::DEBUG),
                    )),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_sub)
        .with(file_sub)
        .init();

    Ok(())
}

/// Routes stderr log lines through the terminal output thread.
struct MakeLogPrinter {
    progress_print: ProgressPrint,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeLogPrinter {
    type Writer = LogPrinter<'a>;

    fn make_writer(&'a self) -> LogPrinter<'a> {
        LogPrinter {
            progress_print: &self.progress_print,
            buf: Vec::new(),
        }
    }
}

/// Buffers one event so it reaches the terminal as a whole line.
struct LogPrinter<'a> {
    progress_print: &'a ProgressPrint,
    buf: Vec<u8>,
}

impl Drop for LogPrinter<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.progress_print
                .print_raw_line(std::mem::take(&mut self.buf));
        }
    }
}

impl std::io::Write for LogPrinter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
