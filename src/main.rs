use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use hookbox::capture::detect::DetectorRegistry;
use hookbox::capture::ingest::{ForwardRelay, IngestService};
use hookbox::capture::server::CaptureServer;
use hookbox::capture::store::{CaptureRepository, FileCaptureStore};
use hookbox::config::{Config, Overrides};
use hookbox::replay::{request_from_capture, DispatchResult, Dispatcher, HttpDispatcher};
use hookbox::templates::{HttpTemplateSource, IndexCache, RunOptions, TemplateService, TemplateStore};
use hookbox::types::HeaderEntry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Capture, inspect and replay webhooks on your machine.
#[derive(Debug, Parser)]
#[command(name = "hookbox", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Root for captures, templates and the index cache.
    #[arg(long, global = true, env = "HOOKBOX_HOME")]
    home: Option<PathBuf>,

    #[arg(long, global = true, env = "HOOKBOX_CAPTURES_DIR")]
    captures_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "HOOKBOX_TEMPLATES_DIR")]
    templates_dir: Option<PathBuf>,

    /// Base URL of the template catalog (serves `index.json`).
    #[arg(long, global = true, env = "HOOKBOX_TEMPLATES_URL")]
    templates_url: Option<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, env = "HOOKBOX_LOG")]
    log: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture server until interrupted.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Replay every stored capture to this URL as well.
        #[arg(long)]
        forward_to: Option<String>,
    },
    /// List stored captures, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one capture as JSON.
    Show { selector: String },
    /// Send a stored capture to another URL.
    Replay {
        selector: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Delete a stored capture.
    Delete { selector: String },
    #[command(subcommand)]
    Templates(TemplatesCommand),
}

#[derive(Debug, Subcommand)]
enum TemplatesCommand {
    /// List templates; `--remote` shows the catalog instead of local copies.
    List {
        #[arg(long)]
        remote: bool,
        #[arg(long)]
        refresh: bool,
    },
    /// Download one template (`provider/id` or `id`), or all with `--all`.
    Download {
        selector: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Send a template to a URL.
    Run {
        selector: String,
        #[arg(long)]
        to: String,
        /// Sign the body the way the provider would.
        #[arg(long, env = "HOOKBOX_SECRET")]
        secret: Option<String>,
        /// Extra `Name: value` headers, applied last.
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Delete one downloaded template, or all with `--all`.
    Delete {
        selector: Option<String>,
        #[arg(long)]
        all: bool,
    },
    ClearCache,
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (host, port) = match &cli.command {
        Command::Serve { host, port, .. } => (host.clone(), *port),
        _ => (None, None),
    };
    let config = Config::resolve(Overrides {
        home: cli.global.home,
        captures_dir: cli.global.captures_dir,
        templates_dir: cli.global.templates_dir,
        templates_url: cli.global.templates_url,
        host,
        port,
        log_level: cli.global.log,
    });

    // Logs go to stderr so command output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    let store = Arc::new(FileCaptureStore::new(&config.captures_dir));
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new());

    match cli.command {
        Command::Serve { forward_to, .. } => serve(&config, store, dispatcher, forward_to).await,
        Command::List { limit } => list_captures(store.as_ref(), limit),
        Command::Show { selector } => {
            let file = store.resolve_by_id_or_prefix(&selector)?;
            println!("{}", serde_json::to_string_pretty(&file.record)?);
            Ok(())
        }
        Command::Replay {
            selector,
            to,
            timeout_ms,
        } => {
            let file = store.resolve_by_id_or_prefix(&selector)?;
            let request = request_from_capture(&file.record, &to, Duration::from_millis(timeout_ms))
                .with_context(|| format!("capture {} has an undecodable body", file.record.id))?;
            let result = dispatcher
                .dispatch(request)
                .await
                .with_context(|| format!("replaying {} to {to}", file.record.id))?;
            print_result(&result);
            Ok(())
        }
        Command::Delete { selector } => {
            let file = store.delete_by_id_or_prefix(&selector)?;
            println!("deleted {}", file.record.id);
            Ok(())
        }
        Command::Templates(cmd) => templates(&config, dispatcher, cmd).await,
    }
}

// ─── Captures ────────────────────────────────────────────────────────────────

async fn serve(
    config: &Config,
    store: Arc<FileCaptureStore>,
    dispatcher: Arc<dyn Dispatcher>,
    forward_to: Option<String>,
) -> anyhow::Result<()> {
    let mut ingest = IngestService::new(store).with_detector(Arc::new(DetectorRegistry::with_builtin()));
    if let Some(target) = forward_to {
        tracing::info!(%target, "forwarding captures");
        ingest = ingest.with_relay(Arc::new(ForwardRelay::new(dispatcher, target, config.request_timeout)));
    }

    let mut server = CaptureServer::new(config.server_config(), Arc::new(ingest));
    let port = server.start().await.context("starting capture server")?;
    println!("listening on http://{}:{port}", config.host);

    tokio::select! {
        result = server.wait() => result.context("capture server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            server.stop(Duration::from_secs(5)).await.context("stopping capture server")?;
        }
    }
    Ok(())
}

fn list_captures(store: &dyn CaptureRepository, limit: usize) -> anyhow::Result<()> {
    for file in store.list(limit)? {
        let r = &file.record;
        println!(
            "{}  {}  {:<7} {:<18} {}",
            r.id,
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.method,
            r.provider,
            r.url
        );
    }
    Ok(())
}

fn print_result(result: &DispatchResult) {
    println!("{} {} ({} ms)", result.status, result.status_text, result.duration.as_millis());
    for h in &result.headers {
        println!("{}: {}", h.key, h.value);
    }
    println!();
    println!("{}", String::from_utf8_lossy(&result.body));
    if result.body_truncated {
        eprintln!("(response body truncated)");
    }
}

// ─── Templates ───────────────────────────────────────────────────────────────

async fn templates(config: &Config, dispatcher: Arc<dyn Dispatcher>, cmd: TemplatesCommand) -> anyhow::Result<()> {
    let mut service = TemplateService::new(
        TemplateStore::new(&config.templates_dir),
        IndexCache::new(&config.cache_file),
        dispatcher,
    )
    .with_ttl(config.index_ttl);
    if let Some(url) = &config.templates_url {
        service = service.with_source(Arc::new(HttpTemplateSource::new(url, config.request_timeout)?));
    }

    match cmd {
        TemplatesCommand::List { remote: true, refresh } => {
            for t in service.list_remote(refresh).await? {
                let mark = if t.is_downloaded { "*" } else { " " };
                println!("{mark} {}/{}  {}", t.metadata.provider, t.metadata.id, t.metadata.name);
            }
        }
        TemplatesCommand::List { remote: false, .. } => {
            for t in service.list_local()? {
                println!(
                    "{}/{}  {}  {}",
                    t.metadata.provider,
                    t.metadata.id,
                    t.downloaded_at.format("%Y-%m-%d %H:%M:%S"),
                    t.file_path.display()
                );
            }
        }
        TemplatesCommand::Download { all: true, .. } => {
            let saved = service.download_all().await?;
            println!("downloaded {} templates", saved.len());
        }
        TemplatesCommand::Download { selector: Some(selector), .. } => {
            let t = service.download(&selector).await?;
            println!("downloaded {}/{} to {}", t.metadata.provider, t.metadata.id, t.file_path.display());
        }
        TemplatesCommand::Run {
            selector,
            to,
            secret,
            headers,
            timeout_ms,
        } => {
            let extra_headers = headers
                .iter()
                .map(|raw| parse_header(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let result = service
                .run(
                    &selector,
                    RunOptions {
                        target_url: to,
                        secret,
                        timeout: Duration::from_millis(timeout_ms),
                        extra_headers,
                    },
                )
                .await?;
            print_result(&result);
        }
        TemplatesCommand::Delete { all: true, .. } => {
            let removed = service.delete_all()?;
            println!("deleted {removed} templates");
        }
        TemplatesCommand::Delete { selector: Some(selector), .. } => {
            service.delete(&selector)?;
            println!("deleted {selector}");
        }
        TemplatesCommand::Download { .. } | TemplatesCommand::Delete { .. } => {
            bail!("give a template selector or --all")
        }
        TemplatesCommand::ClearCache => {
            service.clear_cache()?;
            println!("cleared {}", config.cache_file.display());
        }
    }
    Ok(())
}

fn parse_header(raw: &str) -> anyhow::Result<HeaderEntry> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok(HeaderEntry::new(name.trim(), value.trim())),
        _ => bail!("invalid header {raw:?}, expected `Name: value`"),
    }
}
