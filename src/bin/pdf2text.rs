//! CLI binary for edgequake-pdf2text.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, wires Ctrl-C to a cancel token and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2text::{
    extract_cancellable, inspect, write_atomic, BackendKind, CancelToken, ExtractionConfig,
    FailurePolicy, MergePolicy, OutputSink, PageSelection, PageSeparator, PageTranscript, WriterSink,
    DEFAULT_MODEL,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress sink using indicatif ────────────────────────────────────────────

/// Terminal progress: one bar over pages, a message tracking the segments
/// of the current page, and a log line per finished page.
struct ProgressSink {
    bar: ProgressBar,
    segments_done: AtomicUsize,
    segments_total: AtomicUsize,
}

impl ProgressSink {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(SPINNER),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            segments_done: AtomicUsize::new(0),
            segments_total: AtomicUsize::new(0),
        })
    }

    fn segment_message(&self, page_num: usize) {
        self.bar.set_message(format!(
            "page {page_num} · segment {}/{}",
            self.segments_done.load(Ordering::SeqCst),
            self.segments_total.load(Ordering::SeqCst)
        ));
    }
}

impl OutputSink for ProgressSink {
    fn on_document_start(&self, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  \
             {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn on_page_start(&self, page_num: usize, segment_count: usize) {
        self.segments_done.store(0, Ordering::SeqCst);
        self.segments_total.store(segment_count, Ordering::SeqCst);
        self.segment_message(page_num);
    }

    fn on_segment_complete(&self, page_num: usize, _segment: usize, _text_len: usize) {
        self.segments_done.fetch_add(1, Ordering::SeqCst);
        self.segment_message(page_num);
    }

    fn on_page_complete(&self, page: &PageTranscript) {
        let marked = page.marked_boundaries();
        let note = if marked > 0 {
            yellow(&format!("{marked} unresolved boundar{}", if marked == 1 { "y" } else { "ies" }))
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}  {}  {}",
            green("✓"),
            page.page_num,
            dim(&format!("{:>6} chars", page.text.chars().count())),
            dim(&format!("{:.1}s", page.duration_ms as f64 / 1000.0)),
            note
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} Page {:>3}  {}", red("✗"), page_num, red(&msg)));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, pages_completed: usize, pages_failed: usize) {
        self.bar.finish_and_clear();
        if pages_failed == 0 {
            eprintln!("{} {} pages extracted", green("✔"), bold(&pages_completed.to_string()));
        } else {
            eprintln!(
                "{} {} pages extracted  ({} failed)",
                yellow("⚠"),
                bold(&pages_completed.to_string()),
                red(&pages_failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Local Ollama with the default model, streaming to the terminal
  pdf2text scan.pdf

  # Write to a file, no live output
  pdf2text scan.pdf --stream false -o scan.txt

  # Finer strips for dense pages
  pdf2text --num-splits 6 --overlap-ratio 0.15 contract.pdf

  # A hosted provider instead of Ollama
  pdf2text --provider openai --model gpt-4.1-mini scan.pdf

  # Keep going past failed pages
  pdf2text --best-effort --pages 1-20 book.pdf -o book.txt

  # Inspect PDF metadata (no model needed)
  pdf2text --inspect-only scan.pdf

ENVIRONMENT VARIABLES:
  OLLAMA_HOST             Ollama server (default http://localhost:11434)
  OPENAI_API_KEY          Used with --provider openai (or auto)
  ANTHROPIC_API_KEY       Used with --provider anthropic (or auto)
  GEMINI_API_KEY          Used with --provider gemini (or auto)
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  PDF2TEXT_*              Every flag, e.g. PDF2TEXT_NUM_SPLITS=6
  RUST_LOG                Overrides the log filter
"#;

/// Extract text from PDF files with a vision-language model, one page
/// segment at a time.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2text",
    version,
    about = "Extract text from PDF files using a vision-language model on overlapping page segments",
    long_about = "Rasterises each PDF page, cuts it into overlapping horizontal strips, sends every \
strip to a vision-language model (Ollama by default, or any edgequake-llm provider) and merges \
the transcriptions back into one text without duplicating the overlap.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    pdf_path: String,

    /// Write the text to this file instead of stdout.
    #[arg(short, long, env = "PDF2TEXT_OUTPUT")]
    output: Option<PathBuf>,

    /// Vision model ID.
    #[arg(long, env = "PDF2TEXT_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Number of horizontal segments per page.
    #[arg(long = "num-splits", alias = "num_splits", env = "PDF2TEXT_NUM_SPLITS", default_value_t = 4)]
    num_splits: usize,

    /// Overlap between neighbouring segments, as a fraction of the segment height.
    #[arg(long = "overlap-ratio", alias = "overlap_ratio", env = "PDF2TEXT_OVERLAP_RATIO", default_value_t = 0.1)]
    overlap_ratio: f64,

    /// Stream model output to stderr as it is generated (true|false).
    #[arg(
        long,
        env = "PDF2TEXT_STREAM",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    stream: bool,

    /// Inference backend: ollama (default), openai, anthropic, gemini, azure, auto.
    #[arg(long, env = "PDF2TEXT_PROVIDER")]
    provider: Option<String>,

    /// Ollama server URL.
    #[arg(long, env = "OLLAMA_HOST")]
    ollama_url: Option<String>,

    /// Concurrent segment calls per page.
    #[arg(short, long, env = "PDF2TEXT_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PDF2TEXT_PAGES", default_value = "all")]
    pages: String,

    /// Page marker: marker, comment, none, or a custom string with {page}.
    #[arg(long, env = "PDF2TEXT_SEPARATOR", default_value = "marker")]
    separator: String,

    /// Record failed pages and continue instead of stopping.
    #[arg(long, env = "PDF2TEXT_BEST_EFFORT")]
    best_effort: bool,

    /// On failure, still write the text of the pages completed so far.
    #[arg(long, env = "PDF2TEXT_KEEP_PARTIAL")]
    keep_partial: bool,

    /// Shortest overlap (characters) accepted as a duplicate.
    #[arg(long, env = "PDF2TEXT_MIN_MATCH", default_value_t = 12)]
    min_match: usize,

    /// Marker inserted where two segments could not be reconciled.
    #[arg(long, env = "PDF2TEXT_BOUNDARY_MARKER")]
    boundary_marker: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TEXT_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom prompt.
    #[arg(long, env = "PDF2TEXT_PROMPT_FILE")]
    prompt_file: Option<PathBuf>,

    /// Sampling temperature.
    #[arg(long, env = "PDF2TEXT_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max tokens generated per segment.
    #[arg(long, env = "PDF2TEXT_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// Page render scale.
    #[arg(long, env = "PDF2TEXT_SCALE", default_value_t = 2.0)]
    scale: f32,

    /// Per-call timeout in seconds (between chunks when streaming).
    #[arg(long, env = "PDF2TEXT_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2TEXT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Output structured JSON instead of plain text.
    #[arg(long, env = "PDF2TEXT_JSON")]
    json: bool,

    /// Print PDF metadata only.
    #[arg(long)]
    inspect_only: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PDF2TEXT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level logs.
    #[arg(short, long, env = "PDF2TEXT_VERBOSE")]
    verbose: bool,

    /// Suppress everything except errors.
    #[arg(short, long, env = "PDF2TEXT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Streamed chunks and the progress bar share stderr with the logs, so
    // only errors are logged while either is active.
    let live_stream = cli.stream && !cli.quiet;
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !live_stream;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress || live_stream {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let mut builder = ExtractionConfig::builder().download_timeout_secs(cli.download_timeout);
        if let Some(ref pwd) = cli.password {
            builder = builder.password(pwd);
        }
        let config = builder.build().context("Invalid configuration")?;
        let meta = inspect(&cli.pdf_path, &config).await.context("Failed to inspect PDF")?;

        if cli.json {
            println!("{}", serde_json::to_string_pretty(&meta).context("Failed to serialise metadata")?);
        } else {
            println!("File:         {}", cli.pdf_path);
            if let Some(ref t) = meta.title {
                println!("Title:        {t}");
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {a}");
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            if let Some(ref p) = meta.producer {
                println!("Producer:     {p}");
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    // ── Build config ─────────────────────────────────────────────────────
    let sink: Option<Arc<dyn OutputSink>> = if live_stream {
        Some(Arc::new(WriterSink::new(io::stderr())))
    } else if show_progress {
        Some(ProgressSink::new())
    } else {
        None
    };
    let config = build_config(&cli, sink).await?;

    // ── Ctrl-C → cancel ──────────────────────────────────────────────────
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} cancelling…", yellow("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Run extraction ───────────────────────────────────────────────────
    let output = match extract_cancellable(&cli.pdf_path, &config, &cancel).await {
        Ok(output) => output,
        Err(e) => {
            if let Some(partial) = e.partial_transcript() {
                let text = partial.render(&config.page_separator);
                emit(&cli, text.as_bytes())
                    .await
                    .context("Failed to write partial output")?;
                eprintln!(
                    "{} wrote partial text for {} pages",
                    yellow("⚠"),
                    partial.pages.len()
                );
            }
            return Err(anyhow::Error::new(e).context("Extraction failed"));
        }
    };

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        emit(&cli, json.as_bytes()).await?;
    } else {
        emit(&cli, output.text.as_bytes()).await?;
    }

    if !cli.quiet && !show_progress {
        let s = &output.stats;
        eprintln!(
            "Extracted {}/{} pages ({} segments, {} unresolved boundaries) in {}ms",
            s.processed_pages, s.selected_pages, s.total_segments, s.splices.marked, s.total_duration_ms
        );
    }
    if let Some(path) = &cli.output {
        if !cli.quiet {
            eprintln!("{}  →  {}", green("✔"), bold(&path.display().to_string()));
        }
    }

    if output.stats.failed_pages > 0 {
        for failure in &output.transcript.failures {
            eprintln!("{} page {}: {}", red("✗"), failure.page_num, failure.error);
        }
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

/// Write to the `-o` file (atomically) or to stdout.
async fn emit(cli: &Cli, bytes: &[u8]) -> Result<()> {
    match &cli.output {
        Some(path) => write_atomic(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(bytes).context("Failed to write to stdout")?;
            if !bytes.ends_with(b"\n") {
                handle.write_all(b"\n").context("Failed to write to stdout")?;
            }
            handle.flush().context("Failed to flush stdout")
        }
    }
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, sink: Option<Arc<dyn OutputSink>>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .model(&cli.model)
        .num_splits(cli.num_splits)
        .overlap_ratio(cli.overlap_ratio)
        .stream(cli.stream)
        .concurrency(cli.concurrency)
        .render_scale(cli.scale)
        .temperature(cli.temperature)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .backend(backend_kind(cli.provider.as_deref(), cli.ollama_url.as_deref()))
        .merge_policy(merge_policy(cli))
        .pages(parse_pages(&cli.pages)?)
        .page_separator(parse_separator(&cli.separator))
        .failure_policy(if cli.best_effort {
            FailurePolicy::BestEffort
        } else {
            FailurePolicy::FailFast
        })
        .keep_partial(cli.keep_partial);

    if let Some(n) = cli.max_tokens {
        builder = builder.max_tokens(n);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd);
    }
    if let Some(ref path) = cli.prompt_file {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt from {}", path.display()))?;
        builder = builder.prompt(prompt.trim());
    }
    if let Some(sink) = sink {
        builder = builder.sink(sink);
    }

    builder.build().context("Invalid configuration")
}

fn backend_kind(provider: Option<&str>, ollama_url: Option<&str>) -> BackendKind {
    match provider.map(str::to_lowercase).as_deref() {
        None | Some("ollama") => match ollama_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => BackendKind::Ollama {
                base_url: edgequake_pdf2text::config::normalise_ollama_host(url),
            },
            None => BackendKind::default(),
        },
        Some(name) => BackendKind::Provider { name: name.to_string() },
    }
}

fn merge_policy(cli: &Cli) -> MergePolicy {
    let mut policy = MergePolicy {
        min_match_chars: cli.min_match,
        ..MergePolicy::default()
    };
    if let Some(ref marker) = cli.boundary_marker {
        policy.boundary_marker = marker.clone();
    }
    policy
}

/// Parse `--pages` into a `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok(PageSelection::All);
    }

    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start.trim().parse().context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;
        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {start})");
        }
        if start > end {
            anyhow::bail!("Invalid page range '{start}-{end}': start must be <= end");
        }
        return Ok(PageSelection::Range(start, end));
    }

    if s.contains(',') {
        let pages = s
            .split(',')
            .map(|p| {
                let n: usize = p
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))?;
                if n < 1 {
                    anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {n})");
                }
                Ok(n)
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(PageSelection::Set(pages));
    }

    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {page})");
    }
    Ok(PageSelection::Single(page))
}

/// Parse `--separator` into a `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "marker" | "default" => PageSeparator::Marker,
        "comment" => PageSeparator::Comment,
        "none" => PageSeparator::None,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
