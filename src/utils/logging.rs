use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Filter for our own targets; anything else logs at `warn`
pub fn build_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };

    Ok(EnvFilter::from_default_env()
        .add_directive(format!("crawlforge={}", level).parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = build_filter(verbose)?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(log_file) => {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }

            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(file),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .context("Logging was already initialized")?;

    Ok(())
}

/// Default log file path
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawlforge", "crawlforge") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("crawlforge.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_levels() {
        let quiet = build_filter(false).unwrap().to_string();
        let verbose = build_filter(true).unwrap().to_string();

        assert!(quiet.contains("crawlforge=info"));
        assert!(verbose.contains("crawlforge=debug"));
    }

    #[test]
    fn test_default_log_file_name() {
        assert!(default_log_file().ends_with("crawlforge.log"));
    }
}
