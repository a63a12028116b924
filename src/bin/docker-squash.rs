use std::{
    ffi::OsString,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio_util::sync::CancellationToken;

use docker_squash::{
    progress::Progress,
    squash::{self, SquashOptions},
    Error,
};

/// Flatten a multi-layer container image into a single-layer image
#[derive(Debug, Parser)]
#[clap(name = "docker-squash", version)]
pub struct App {
    /// Image archive to read, or docker://<reference> to pull from a registry
    source: String,

    /// Where to write the squashed image archive
    dest: PathBuf,

    /// Reference name for the squashed image [default: docker-squash-<timestamp>:latest]
    #[clap(long, short)]
    tag: Option<String>,

    /// Don't show progress
    #[clap(long, short)]
    quiet: bool,
}

/// Rewrites the single-dash long options `-tag`, `-tag=<ref>` and `-quiet` to their `--` form,
/// which clap would otherwise read as bundled short flags.
fn long_options(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    let mut args = args.into_iter();
    let mut out = vec![];
    for arg in args.by_ref() {
        if arg == "--" {
            out.push(arg);
            break;
        }
        let rewritten = arg.to_str().and_then(|s| {
            let name = s.strip_prefix('-')?;
            let flag = name.split_once('=').map_or(name, |(flag, _)| flag);
            matches!(flag, "tag" | "quiet").then(|| OsString::from(format!("-{s}")))
        });
        out.push(rewritten.unwrap_or(arg));
    }
    out.extend(args);
    out
}

/// Renders each pipeline stage as a spinner with a byte count.
struct Spinners {
    multi: MultiProgress,
    style: ProgressStyle,
    current: Mutex<Option<ProgressBar>>,
}

impl Spinners {
    fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let style = ProgressStyle::with_template("{spinner} {msg} {decimal_bytes:>10} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        Spinners {
            multi,
            style,
            current: Mutex::new(None),
        }
    }
}

impl Progress for Spinners {
    fn stage(&self, message: &str) {
        let bar = self.multi.add(
            ProgressBar::new_spinner()
                .with_style(self.style.clone())
                .with_message(message.to_string()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(bar) {
                previous.finish();
            }
        }
    }

    fn advance(&self, total: u64) {
        if let Ok(current) = self.current.lock() {
            if let Some(bar) = &*current {
                bar.set_position(total);
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(bar) = current.take() {
                bar.finish();
            }
        }
    }
}

async fn squash(args: App) -> Result<()> {
    let options = SquashOptions {
        tag: args.tag,
        quiet: args.quiet,
        tmpdir: None,
    };
    let progress = Arc::new(Spinners::new(args.quiet));
    let cancel = CancellationToken::new();

    let mut task = tokio::spawn({
        let (source, dest, cancel) = (args.source.clone(), args.dest.clone(), cancel.clone());
        let progress: Arc<dyn Progress> = progress.clone();
        async move { squash::run(&source, &dest, &options, progress, cancel).await }
    });

    let result = tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            task.await
        }
    };
    progress.finish();

    let report = match result.context("squash task failed")? {
        Ok(report) => report,
        Err(e) => {
            let stage = e.stage();
            return Err(anyhow::Error::new(e).context(format!("{stage} stage failed")));
        }
    };

    if !args.quiet {
        println!(
            "Squashed {} into {} ({} entries, layer {}, {} bytes)",
            args.source,
            args.dest.display(),
            report.entries,
            report.layer_digest,
            report.layer_size,
        );
        println!("Tagged {}", report.reference);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = App::parse_from(long_options(std::env::args_os()));

    match squash(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if matches!(e.downcast_ref::<Error>(), Some(Error::Interrupted)) {
                ExitCode::from(130)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
