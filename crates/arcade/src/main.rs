//! Arcade command-line client.
//!
//! Every subcommand opens the store named by `--store`, performs one
//! resource operation and prints the result as JSON on stdout.

mod cli;

use std::path::PathBuf;
use std::process::ExitCode;

use arcade_logging::{LogConfig, LOG_DIR_ENV};
use arcade_resources::defaults::{
    DEFAULT_PAGE_SIZE, DEFAULT_STORE_URL, DEFAULT_TABLE_NAME, DEFAULT_TRANSACTION_RETRIES,
};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "arcade", about = "Tag-indexed resource store", version)]
struct Cli {
    /// Store to open: `sqlite:<path>`, `sqlite::memory:` or `memory:`
    #[arg(long, global = true, env = "ARCADE_STORE", default_value = DEFAULT_STORE_URL)]
    store: String,

    /// Table holding every item
    #[arg(long, global = true, env = "ARCADE_TABLE", default_value = DEFAULT_TABLE_NAME)]
    table: String,

    /// Attempts per transaction when the store reports a conflict
    #[arg(long, global = true, env = "ARCADE_RETRIES", default_value_t = DEFAULT_TRANSACTION_RETRIES)]
    retries: u32,

    /// Also write log files to this directory
    #[arg(long, global = true, env = LOG_DIR_ENV)]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the resource types the store knows
    Types,

    /// Create a resource
    Create {
        /// Resource type, by prefix (`g`) or name (`group`)
        #[arg(value_name = "TYPE")]
        resource_type: String,

        /// Field as name=value; the value is parsed as JSON when it can be
        #[arg(short = 'f', long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Tag as key:value, percent-encoded
        #[arg(short = 't', long = "tag", value_name = "KEY:VALUE")]
        tags: Vec<String>,

        /// Recorded as the creator
        #[arg(long, env = "ARCADE_USER", default_value = "cli")]
        user: String,
    },

    /// Show one resource
    Get {
        #[arg(value_name = "TYPE")]
        resource_type: String,
        id: String,
    },

    /// Change fields and tags of a resource
    Update {
        #[arg(value_name = "TYPE")]
        resource_type: String,
        id: String,

        /// Field to set, as name=value
        #[arg(short = 'f', long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Field to remove
        #[arg(long = "remove-field", value_name = "NAME")]
        remove_fields: Vec<String>,

        /// Tag to set, as key:value
        #[arg(short = 't', long = "tag", value_name = "KEY:VALUE")]
        tags: Vec<String>,

        /// Tag to remove
        #[arg(long = "remove-tag", value_name = "KEY")]
        remove_tags: Vec<String>,

        /// Recorded as the updater
        #[arg(long, env = "ARCADE_USER", default_value = "cli")]
        user: String,
    },

    /// Delete a resource and its tags
    Delete {
        #[arg(value_name = "TYPE")]
        resource_type: String,
        id: String,
    },

    /// List resources, optionally filtered by tags
    List {
        #[arg(value_name = "TYPE")]
        resource_type: String,

        /// Required tag as key:value; repeat to intersect
        #[arg(short = 't', long = "tag", value_name = "KEY:VALUE")]
        tags: Vec<String>,

        /// Required searchable field as name=value
        #[arg(short = 'f', long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Only the latest version per parent
        #[arg(long)]
        latest: bool,

        /// Attach the latest versioned child of each result
        #[arg(long)]
        include_latest: bool,

        /// Page size
        #[arg(short = 'n', long, default_value_t = DEFAULT_PAGE_SIZE)]
        count: usize,

        /// Continue after a previous page
        #[arg(long)]
        token: Option<String>,
    },

    /// Show the latest child of a parent
    Latest {
        #[arg(value_name = "TYPE")]
        resource_type: String,

        /// Parent resource id
        parent_id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match arcade_logging::init_logging(LogConfig {
        app_name: "arcade",
        verbose: cli.verbose,
        log_dir: cli.log_dir.clone(),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: failed to initialize logging: {err:#}");
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start async runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(cli::run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::from(1)
        }
    }
}
