use anyhow::{bail, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use ytwrap::progress::PROGRESS_TEMPLATE;
use ytwrap::{binary, Config, PresetManager, ProgressEvent, ProgressTransform, SpawnRequest};

#[derive(Parser, Debug)]
#[command(name = "ytwrap")]
#[command(about = "Run a command-line downloader and report its progress", long_about = None)]
struct Args {
    /// URLs to download
    urls: Vec<String>,

    /// Downloader executable (overrides the config file)
    #[arg(short, long)]
    binary: Option<PathBuf>,

    /// Preset name or shortcut
    #[arg(short, long)]
    preset: Option<String>,

    /// Also print output lines that are not progress updates
    #[arg(long)]
    raw: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Launch attempts before giving up
    #[arg(long)]
    tries: Option<u32>,

    /// List configured presets and exit
    #[arg(long)]
    list_presets: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Config::load();
    let presets = PresetManager::load()?;

    if args.list_presets {
        for preset in presets.all() {
            println!(
                "{:<12} {:<4} {}",
                preset.name,
                preset.shortcut.as_deref().unwrap_or("-"),
                preset.description
            );
        }
        return Ok(());
    }

    if args.urls.is_empty() {
        bail!("No URLs given");
    }

    let preset_args = match &args.preset {
        Some(key) => match presets.resolve(key) {
            Some(preset) => preset.args.clone(),
            None => {
                let suggestions: Vec<&str> = presets
                    .fuzzy_search(key)
                    .into_iter()
                    .take(3)
                    .map(|(p, _)| p.name.as_str())
                    .collect();
                if suggestions.is_empty() {
                    bail!("Unknown preset: {key}");
                }
                bail!("Unknown preset: {key} (did you mean {}?)", suggestions.join(", "));
            }
        },
        None => Vec::new(),
    };

    let binary = args.binary.unwrap_or_else(|| PathBuf::from(&config.binary));
    binary::ensure_executable(&binary)?;

    let ctx = config.governor.context();
    let mut request = config.governor.apply(
        SpawnRequest::new(binary.to_string_lossy())
            .args(build_args(&preset_args, &args.urls))
            .with_transform(ProgressTransform::new(args.raw).into_transform()),
    );
    if let Some(tries) = args.tries {
        request = request.try_count(tries);
    }

    let Some(controller) = ctx.spawn(request).await else {
        eprintln!("Error: could not start {}", binary.display());
        std::process::exit(127);
    };

    let killer = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            killer.kill();
        }
    });

    let mut events = controller.listen();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => print_event(&event, args.json)?,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable output, no further progress will be shown");
                break;
            }
        }
    }
    drop(events);

    let exit = controller.wait().await;
    if let Some(signal) = &exit.signal {
        eprintln!("Downloader terminated by {signal}");
    }
    std::process::exit(exit.code.unwrap_or(1));
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Downloader arguments: progress reporting, then preset arguments, then URLs
fn build_args(preset_args: &[String], urls: &[String]) -> Vec<String> {
    let mut args = vec![
        "--newline".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
    ];
    args.extend(preset_args.iter().cloned());
    args.extend(urls.iter().cloned());
    args
}

fn print_event(event: &ProgressEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        ProgressEvent::Progress(payload) => match event.percent() {
            Some(percent) => println!(
                "{percent:5.1}%  {}",
                event.status().unwrap_or("downloading")
            ),
            None => println!("{payload}"),
        },
        ProgressEvent::Line(line) => println!("{line}"),
    }
    Ok(())
}
