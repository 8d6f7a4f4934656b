use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(about = "Loads a Subversion dump stream into a repository, one commit per revision")]
pub(crate) struct Cli {
    #[arg(
        long = "stderr-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum stderr log level (warn by default)"
    )]
    pub(crate) stderr_log_level: Option<LogLevel>,
    #[arg(
        long = "log-file",
        value_name = "PATH",
        help = "File to write logs (besides stderr)"
    )]
    pub(crate) log_file: Option<PathBuf>,
    #[arg(
        long = "file-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum file log level (debug by default)"
    )]
    pub(crate) file_log_level: Option<LogLevel>,
    #[arg(long = "no-progress", help = "Do not print progress")]
    pub(crate) no_progress: bool,
    #[arg(
        long = "src",
        short = 's',
        value_name = "PATH",
        help = "Dump file to load, possibly compressed (\"-\" for stdin)"
    )]
    pub(crate) src: PathBuf,
    #[arg(
        long = "params",
        short = 'P',
        value_name = "FILE",
        help = "Load parameters"
    )]
    pub(crate) params: Option<PathBuf>,
    #[arg(
        long = "export",
        value_name = "DIR",
        help = "Directory where the head revision is written after loading"
    )]
    pub(crate) export: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl LogLevel {
    pub(crate) fn to_log_level_filter(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}
