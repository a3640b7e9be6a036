use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "photosyncd", about = "Sync and serve a remote photo library")]
pub struct Cli {
    /// Account email address
    #[arg(short = 'u', long, env = "PHOTOSYNCD_EMAIL")]
    pub email: String,

    /// Long-lived device token.
    /// WARNING: passing via --device-token is visible in process listings.
    /// Prefer the PHOTOSYNCD_DEVICE_TOKEN environment variable instead.
    #[arg(long, env = "PHOTOSYNCD_DEVICE_TOKEN")]
    pub device_token: String,

    /// Device identifier the token was issued to
    #[arg(long, env = "PHOTOSYNCD_DEVICE_ID")]
    pub device_id: String,

    /// Path to the local index database
    #[arg(long, default_value = "~/.photosyncd/index.db")]
    pub db: String,

    /// Directory for in-flight download scratch files
    #[arg(long, default_value = "~/.photosyncd/scratch")]
    pub scratch_dir: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring the local index up to date with the remote library
    Sync {
        /// Run continuously, waiting N seconds between passes
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Print index statistics
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Look up indexed items by file name
    Lookup {
        /// File name to match exactly
        name: String,
    },

    /// Download an item's bytes
    Download {
        /// File name of the item to download
        name: String,

        /// Write to this path instead of stdout
        #[arg(short = 'o', long)]
        output: Option<String>,
    },

    /// Upload a local file as a new library item
    Upload {
        /// File to upload
        path: String,
    },

    /// Move items to the remote trash by file name
    Trash {
        /// File names of the items to trash
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}
