use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP server with the ingestion pipeline and live updates
    Serve,

    /// Embed text and print a summary of the vector
    Embed {
        /// Text to embed, e.g. "cat cute sleeping"
        text: String,
    },

    /// Query the feed locally and print it as JSON
    Feed {
        /// Rank by similarity to this text instead of recency
        #[clap(short, long)]
        filter: Option<String>,

        /// Cursor from a previous page
        #[clap(short, long)]
        cursor: Option<String>,

        /// Page size (clamped to the configured maximum)
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Process every pending item, then exit
    Recover,
}
