use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pagebert::search::SearchMode;

#[derive(Debug, Parser)]
#[command(
    name = "pagebert",
    about = "Two-stage multi-vector search over document pages and text chunks"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search stored pages and text chunks
    Search(SearchArgs),
    /// List registered documents and their processing state
    Documents(DocumentsArgs),
    /// Show system status and storage statistics
    Status(StatusArgs),
    /// Remove a document and all of its items
    Remove {
        /// Document ID (#abcdef or any unique hex prefix, full hex, or decimal)
        doc_id: String,
    },
    /// Manage the ColBERT model configuration
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Inspect or change persisted engine settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Model --

#[derive(Debug, Subcommand)]
pub enum ModelAction {
    /// Show the currently resolved model
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a default model ID or local path in config.redb
    Set {
        /// Model ID (HuggingFace) or local path
        model: String,
    },
    /// Clear the stored model setting (revert to default)
    Clear,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the resolved configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting
    Set {
        /// Setting name (e.g. candidate_limit, precision, device)
        key: String,
        value: String,
    },
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Which collections to search
    #[arg(short, long, value_enum, default_value_t = SearchMode::Hybrid)]
    pub mode: SearchMode,

    /// Number of results to return (defaults to the top_k setting)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Minimum score threshold
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Documents --

#[derive(Debug, Parser)]
pub struct DocumentsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "pagebert",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["pagebert", "search", "hello"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "hello");
                assert_eq!(args.mode, SearchMode::Hybrid);
                assert_eq!(args.count, None);
                assert_eq!(args.min_score, None);
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_search_mode() {
        let cli = Cli::parse_from([
            "pagebert",
            "search",
            "revenue",
            "--mode",
            "visual-only",
            "-n",
            "3",
        ]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.mode, SearchMode::VisualOnly);
                assert_eq!(args.count, Some(3));
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["pagebert", "-q", "-v", "status"]).is_err());
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
