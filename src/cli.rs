use clap::{Parser, Subcommand, ValueEnum};

use crate::{ids::ItemId, items::ItemKind};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum KindArg {
    Lost,
    Found,
}

impl From<KindArg> for ItemKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Lost => ItemKind::Lost,
            KindArg::Found => ItemKind::Found,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API and process "item created" events.
    Daemon {
        /// Address to listen on
        #[clap(long, env = "ITEMMATCH_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,
    },

    /// Generate (or regenerate) the embedding of one item
    Embed {
        id: ItemId,
    },

    /// Embed every item that has text but no vector yet
    Backfill {
        /// Provider calls in flight at once. Defaults to config.
        #[clap(long)]
        concurrency: Option<usize>,

        /// Minimum delay between two provider calls. Defaults to config.
        #[clap(long)]
        min_delay_ms: Option<u64>,

        /// Also re-embed vectors produced by a different model
        #[clap(long, default_value = "false")]
        include_stale: bool,
    },

    /// List the items most similar to the given one
    Matches {
        id: ItemId,

        /// Number of results. Defaults to config.
        #[clap(short)]
        k: Option<usize>,
    },

    /// Post a new item; its embedding is generated in background
    Add {
        /// Item title
        #[clap(short, long, default_value = "")]
        title: String,

        /// Item description
        #[clap(short, long, default_value = "")]
        description: String,

        #[clap(long, value_enum)]
        kind: Option<KindArg>,

        #[clap(short, long)]
        category: Option<String>,

        #[clap(short, long)]
        location: Option<String>,

        /// Posting user
        #[clap(short, long)]
        owner: Option<String>,
    },

    /// Print one item
    Show {
        id: ItemId,
    },

    /// Delete one item together with its embedding
    Delete {
        id: ItemId,
    },

    /// Item counts by embedding state
    Status {},
}
