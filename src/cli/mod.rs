pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration profile to use instead of the default one
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Configuration file to use instead of the default one
    #[arg(short, long, global = true, conflicts_with = "profile")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a crawling job and run it to the end
    Crawl {
        /// Target URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Job type (url, seo)
        #[arg(short = 't', long = "type", default_value = "url")]
        job_type: String,

        /// Maximum crawling depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Maximum number of pages to crawl
        #[arg(short, long)]
        limit: Option<u64>,

        /// Queue order (bfs, dfs)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Fetch engine (http, browser)
        #[arg(short, long)]
        engine: Option<String>,
    },

    /// Run or resume a stored job
    Run {
        #[arg(required = true)]
        job_id: String,
    },

    /// List all jobs, newest first
    Jobs,

    /// Check status of a crawling job
    Status {
        /// Job ID to check status for
        #[arg(required = true)]
        job_id: String,
    },

    /// Cancel a job
    Cancel {
        #[arg(required = true)]
        job_id: String,
    },

    /// Scrape a Twitter/X, Instagram or TikTok profile
    Scrape {
        #[arg(required = true)]
        url: String,

        /// Maximum number of posts to return
        #[arg(short, long, default_value_t = 20)]
        max_items: usize,

        /// Write the result to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export the dataset of a job
    Export {
        /// Job ID to export data from
        #[arg(required = true)]
        job_id: String,

        /// Export format (json, csv, xml)
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Indent JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Compare two JSON dataset exports
    Diff {
        #[arg(required = true)]
        old: PathBuf,

        #[arg(required = true)]
        new: PathBuf,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to show or create
        #[arg(required = false)]
        name: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let source = commands::ConfigSource {
        profile: cli.profile,
        path: cli.config,
    };

    match cli.command {
        Commands::Crawl { url, job_type, depth, limit, strategy, engine } => {
            info!("Starting {} crawl on {}", job_type, url);
            let overrides = commands::CrawlOverrides { depth, limit, strategy, engine };
            commands::crawl(&source, url, job_type, overrides).await
        },
        Commands::Run { job_id } => {
            info!("Running job {}", job_id);
            commands::run(&source, job_id).await
        },
        Commands::Jobs => commands::jobs(&source).await,
        Commands::Status { job_id } => {
            info!("Checking status for job {}", job_id);
            commands::status(&source, job_id).await
        },
        Commands::Cancel { job_id } => commands::cancel(&source, job_id).await,
        Commands::Scrape { url, max_items, output } => {
            info!("Scraping {}", url);
            commands::scrape(&source, url, max_items, output).await
        },
        Commands::Export { job_id, format, output, pretty } => {
            info!("Exporting job {} as {}", job_id, format);
            commands::export(&source, job_id, format, output, pretty).await
        },
        Commands::Diff { old, new } => commands::diff(old, new).await,
        Commands::Config { name, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = name {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                commands::show_config(&source)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_crawl() {
        let cli = Cli::try_parse_from([
            "crawlforge", "crawl", "https://example.com", "--type", "seo", "--depth", "2", "--strategy", "dfs", "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Crawl { url, job_type, depth, strategy, limit, .. } => {
                assert_eq!(url, "https://example.com");
                assert_eq!(job_type, "seo");
                assert_eq!(depth, Some(2));
                assert_eq!(strategy.as_deref(), Some("dfs"));
                assert_eq!(limit, None);
            }
            _ => panic!("expected crawl"),
        }
    }

    #[test]
    fn test_profile_and_config_conflict() {
        let result = Cli::try_parse_from(["crawlforge", "--profile", "news", "--config", "a.yaml", "jobs"]);
        assert!(result.is_err());
    }
}
