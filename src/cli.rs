use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml, the model cache and the index snapshot.
    /// Falls back to $REVIEW_INDEX_BASE_PATH, then ./data
    #[clap(long, global = true)]
    pub base_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server.
    Serve {},
    /// Index reviews. Pass --id and --text once per review, in matching order.
    Add {
        /// Review id
        #[clap(long = "id", required = true)]
        ids: Vec<i64>,

        /// Review text
        #[clap(long = "text", required = true)]
        texts: Vec<String>,
    },
    /// Find reviews similar to a query
    Search {
        query: String,

        /// Number of results
        #[clap(short, default_value = "10")]
        k: usize,

        /// Only consider these review ids
        #[clap(long = "filter")]
        filter: Vec<i64>,
    },
    /// Remove a review from the index
    Remove { id: i64 },
    /// Print index statistics
    Stats {},
    /// Remove every review and delete the snapshot
    Clear {
        /// Confirm clearing the index
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// Print the raw embedding of a text
    Embed { text: String },
}

impl Command {
    /// Commands that write the index and need the directory lock.
    pub fn mutates_index(&self) -> bool {
        matches!(
            self,
            Command::Serve {} | Command::Add { .. } | Command::Remove { .. } | Command::Clear { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_pairs() {
        let args = Args::parse_from([
            "review-index",
            "add",
            "--id",
            "1",
            "--text",
            "great product",
            "--id",
            "2",
            "--text",
            "terrible",
        ]);

        match args.command {
            Command::Add { ids, texts } => {
                assert_eq!(ids, vec![1, 2]);
                assert_eq!(texts, vec!["great product", "terrible"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_search() {
        let args = Args::parse_from([
            "review-index",
            "--base-path",
            "/tmp/reviews",
            "search",
            "loved it",
            "-k",
            "3",
            "--filter",
            "4",
            "--filter",
            "5",
        ]);

        assert_eq!(args.base_path, Some(PathBuf::from("/tmp/reviews")));
        match args.command {
            Command::Search { query, k, filter } => {
                assert_eq!(query, "loved it");
                assert_eq!(k, 3);
                assert_eq!(filter, vec![4, 5]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_only_writers_take_the_lock() {
        let mutates = |argv: &[&str]| Args::parse_from(argv).command.mutates_index();

        assert!(mutates(&["review-index", "serve"]));
        assert!(mutates(&["review-index", "add", "--id", "1", "--text", "ok"]));
        assert!(mutates(&["review-index", "remove", "1"]));
        assert!(mutates(&["review-index", "clear", "--yes"]));

        assert!(!mutates(&["review-index", "stats"]));
        assert!(!mutates(&["review-index", "search", "ok"]));
        assert!(!mutates(&["review-index", "embed", "ok"]));
    }

    #[test]
    fn test_search_default_k() {
        let args = Args::parse_from(["review-index", "search", "ok"]);
        assert!(matches!(args.command, Command::Search { k: 10, .. }));
    }
}
