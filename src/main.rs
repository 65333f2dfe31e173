//! CLI entry point for the media downloader.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::CommandFactory;
use mediadl_core::ffmpeg::DEFAULT_FFMPEG;
use mediadl_core::{Dispatcher, Ffmpeg, HandlerContext, ProgressSurface};
use tracing::{debug, error, info};

mod app_config;
mod cli;

use cli::Args;

/// Process outcome mapped to an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    Failure,
    Interrupted,
}

impl ProcessExit {
    fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Interrupted => 130,
        }
    }
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        Self::from(exit.code())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let (args, sources) = match cli::try_parse_with_sources(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(err) => err.exit(),
    };

    // RUST_LOG wins over --debug; logs go to stderr below the progress bars
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match run(args, sources).await {
        Ok(exit) => exit.into(),
        Err(err) => {
            error!("{err:#}");
            ProcessExit::Failure.into()
        }
    }
}

async fn run(args: Args, sources: cli::CliValueSources) -> Result<ProcessExit> {
    let loaded = app_config::load_file_config(args.config.as_deref())?;
    if let (Some(path), Some(_)) = (&loaded.path, &loaded.config) {
        debug!(path = %path.display(), "loaded config file");
    }
    let file_config = loaded.config.unwrap_or_default();

    let mut options = args.option_map();
    file_config.apply_defaults(&mut options, &sources);

    let progress = Arc::new(if io::stderr().is_terminal() {
        ProgressSurface::new()
    } else {
        ProgressSurface::hidden()
    });
    let tool = Arc::new(Ffmpeg::new(
        file_config.ffmpeg.as_deref().unwrap_or(DEFAULT_FFMPEG),
    ));
    let dispatcher =
        Dispatcher::with_default_handlers(HandlerContext::new(Arc::clone(&progress), tool));

    let Some(method) = args.method.as_deref() else {
        Args::command()
            .print_help()
            .context("Failed to print help")?;
        return Ok(ProcessExit::Success);
    };

    if method == "help" {
        print_handler_help(&dispatcher, args.keys.first().map(String::as_str));
        return Ok(ProcessExit::Success);
    }

    let dispatched = match dispatcher.dispatch(method, &args.keys, &options) {
        Ok(dispatched) => dispatched,
        Err(err) => {
            error!(error = %err, "cannot dispatch");
            return Ok(ProcessExit::Failure);
        }
    };
    info!(
        handler = dispatched.handler,
        method = dispatched.method,
        keys = args.keys.len(),
        "starting"
    );

    progress.start();
    let report = tokio::select! {
        report = dispatched.run => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    progress.stop();

    let Some(report) = report else {
        eprintln!("interrupted: re-run the same command to continue");
        return Ok(ProcessExit::Interrupted);
    };

    let failed = report.failures().count();
    info!(
        files = report.files().count(),
        failed,
        total = args.keys.len(),
        "Download complete"
    );
    if report.is_fatal() {
        return Ok(ProcessExit::Failure);
    }
    Ok(ProcessExit::Success)
}

fn print_handler_help(dispatcher: &Dispatcher, tag: Option<&str>) {
    if let Some(info) = tag.and_then(|tag| dispatcher.info(tag)) {
        print!("{}", info.help_text());
        return;
    }
    if let Some(tag) = tag {
        eprintln!("no handler named '{tag}'");
    }
    println!("handlers:");
    for info in dispatcher.infos() {
        println!("  {:<10} {}", info.tag, info.help);
    }
    println!("\nrun `mediadl help <handler>` for its methods and options");
}

#[cfg(test)]
mod tests {
    use super::ProcessExit;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProcessExit::Success.code(), 0);
        assert_eq!(ProcessExit::Failure.code(), 1);
        assert_eq!(ProcessExit::Interrupted.code(), 130);
    }
}
