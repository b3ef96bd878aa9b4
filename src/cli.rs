use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Start the HTTP search service.
    Serve {
        /// Listen address. Overrides server.addr from config.yaml
        #[clap(long)]
        addr: Option<String>,
    },
    /// Add a room
    Add {
        /// Unique room id
        room_id: String,

        /// Room name to embed
        room_name: String,
    },
    /// Delete a room
    Delete {
        /// Room id
        room_id: String,
    },
    /// Search rooms by name similarity
    Search {
        /// Keyword or phrase
        query: String,

        /// Number of results
        #[clap(short, long)]
        k: Option<usize>,
    },
    /// List all rooms
    Rooms {},
    /// Print index statistics
    Stats {},
}
