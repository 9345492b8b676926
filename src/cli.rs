//! Definitions for the CLI commands, arguments and help texts
//!
//! Makes heavy use of <https://docs.rs/clap/latest/clap/>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to profile.yaml
    #[arg(short, long, global = true, default_value = "profile.yaml")]
    pub profile: PathBuf,

    /// Print results as JSON, for scripts driving the import
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Authenticate with the catalog via integration admin API.
    /// Credentials are stored in .credentials.toml in the current working directory.
    Auth {
        /// base URL of the catalog
        #[arg(short, long)]
        domain: String,

        /// integration access key id
        #[arg(short, long)]
        id: String,

        /// integration access key secret
        #[arg(short, long)]
        secret: String,

        /// password of the vendor SFTP account
        #[arg(long)]
        sftp_password: Option<String>,
    },

    /// Write the default profile.yaml to the current folder
    Init {
        /// Overwrite an existing profile
        #[arg(short, long)]
        force: bool,
    },

    /// Download and parse the feed without caching it
    TestConnection,

    /// Download the feed and cache it for processing (phase 1)
    Fetch,

    /// Cache a local feed file for processing (phase 1)
    FetchFile {
        /// Path to data file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Process one batch of a cached feed (phase 2)
    Process {
        /// Key printed by fetch
        #[arg(short, long)]
        cache_key: String,

        /// First row of the batch, 0 based
        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Fetch and process the whole feed, resuming an unfinished run
    Run {
        /// Ignore an unfinished run and start over
        #[arg(long)]
        fresh: bool,
    },

    /// Show the progress of the current run
    Status,

    /// Abandon the current run
    Discard {
        /// Only forget the progress, leave the cached feed to expire
        #[arg(long)]
        keep_cache: bool,
    },

    /// Show the latest finished or failed imports
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}
