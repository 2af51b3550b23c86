use std::path::PathBuf;

use clap::{Args, Subcommand};

use periodicals_sync::EditionId;

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Base URL of the periodicals API
    #[arg(long = "api-url", env = "PSYNC_API_URL", default_value = "http://localhost:8080/")]
    pub api_url: url::Url,

    /// Directory holding the local store and downloaded files
    #[arg(short = 'd', long = "data-dir", env = "PSYNC_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Bearer token sent with every request
    #[arg(long, env = "PSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Maximum number of concurrent downloads
    #[arg(short = 'c', long, default_value_t = periodicals_sync::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Quiet period before bookmark and reading position changes are sent
    #[arg(long = "quiet-period-ms", default_value_t = 2000)]
    pub quiet_period_ms: u64,
}

impl Settings {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download editions and show progress until all finish
    Download {
        #[arg(required = true)]
        editions: Vec<EditionId>,

        /// Publication the editions belong to
        #[arg(short = 'p', long)]
        publication: String,
    },

    /// Delete a downloaded edition
    Delete {
        edition: EditionId,

        #[arg(short = 'p', long)]
        publication: String,
    },

    /// List downloaded editions
    List,

    /// Show, add, remove or synchronize bookmarks of an edition
    Bookmarks {
        edition: EditionId,

        /// Bookmark this page
        #[arg(long, conflicts_with = "remove")]
        add: Option<u32>,

        /// Remove the bookmark on this page
        #[arg(long)]
        remove: Option<u32>,

        /// Synchronize with the server immediately
        #[arg(long)]
        sync: bool,
    },

    /// Record reading positions; the last one is sent after the quiet period
    Read {
        edition: EditionId,

        #[arg(long = "page", required = true)]
        pages: Vec<u32>,
    },

    /// Remember the username that owns the download directory
    LoginName { username: String },
}
