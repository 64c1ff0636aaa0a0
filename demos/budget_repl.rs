//! Interactive chat REPL that shows the context budget after every turn.
//!
//! Usage:
//!   ANTHROPIC_API_KEY=sk-... cargo run --example budget_repl
//!   ANTHROPIC_API_KEY=sk-... cargo run --example budget_repl -- --context-window 8000 --retention 2000
//!   ANTHROPIC_API_KEY=sk-... cargo run --example budget_repl -- --config windows.json --session-dir .sessions
//!
//! Lines starting with `!` run a shell command and append its output as a
//! tool result. `/compact` compacts now, `/status` prints the budget, `/save`
//! checkpoints the session. Type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use context_budget::{
    AnthropicProvider, BudgetEvent, CompactionOutcome, ContextConfig, FileSessionStore,
    GenerateRequest, InferenceProvider, ItemKind, ProviderSummarizer, SessionBuilder,
    SessionHandle,
};

#[derive(Parser)]
#[command(name = "budget_repl", about = "Chat with a model while watching the context budget")]
struct Cli {
    /// Model to use
    #[arg(long, default_value = "claude-sonnet-4-20250514")]
    model: String,

    /// System prompt
    #[arg(long, short = 's')]
    system: Option<String>,

    /// System prompt for summarization requests
    #[arg(long)]
    summary_prompt: Option<String>,

    /// JSON file with per-backend window settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the context window size
    #[arg(long)]
    context_window: Option<u32>,

    /// Override the retention budget for compaction
    #[arg(long)]
    retention: Option<u32>,

    /// Directory for session checkpoints
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Resume this session id from --session-dir
    #[arg(long)]
    resume: Option<String>,

    /// API base URL
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("error: ANTHROPIC_API_KEY not set");
        std::process::exit(1);
    });
    let mut provider = AnthropicProvider::new(&api_key);
    if let Some(ref url) = cli.base_url {
        provider = provider.with_base_url(url);
    }

    let contexts = match cli.config {
        Some(ref path) => ContextConfig::load(path).await.unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        }),
        None => ContextConfig::default(),
    };
    let mut window = contexts.window_for(&cli.model);
    if let Some(tokens) = cli.context_window {
        window = window.with_context_window(tokens);
    }
    if let Some(tokens) = cli.retention {
        window = window.with_retention_budget(tokens);
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<BudgetEvent>(64);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BudgetEvent::ThresholdCrossed { percentage_used, .. } => {
                    eprintln!(
                        "\x1b[33m  [threshold crossed at {:.0}%]\x1b[0m",
                        percentage_used * 100.0
                    );
                }
                BudgetEvent::CompactionStarted { candidates, candidate_tokens } => {
                    eprintln!("\x1b[35m  [compacting {candidates} items, {candidate_tokens} tokens]\x1b[0m");
                }
                BudgetEvent::Compacted { pre_tokens, post_tokens } => {
                    eprintln!("\x1b[35m  [compacted: {pre_tokens} → {post_tokens} tokens]\x1b[0m");
                }
                BudgetEvent::CompactionFailed { reason } => {
                    eprintln!("\x1b[31m  [compaction failed: {reason}]\x1b[0m");
                }
                BudgetEvent::LedgerCorrupted { reason } => {
                    eprintln!("\x1b[1;31m  [ledger corrupted: {reason}]\x1b[0m");
                }
                BudgetEvent::ItemAppended { .. } => {}
            }
        }
    });

    let mut summarizer = ProviderSummarizer::new(provider.clone(), &cli.model);
    if let Some(ref prompt) = cli.summary_prompt {
        summarizer = summarizer.with_prompt(prompt);
    }
    let mut builder = SessionBuilder::new(summarizer)
        .with_config(window)
        .with_events(tx);
    if let Some(ref dir) = cli.session_dir {
        builder = builder.with_store(FileSessionStore::new(dir));
    }
    let handle = match cli.resume {
        Some(ref id) => match builder.resume(id).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                eprintln!("error: no checkpoint for session '{id}'");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        None => builder.build().unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        }),
    };

    eprintln!("context-budget repl");
    eprintln!("model: {}", cli.model);
    eprintln!("session: {}", handle.session_id());
    eprintln!("{}", handle.report_line());
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match trimmed {
            "exit" | "quit" | "/q" => break,
            "/status" => {
                print_status(&handle);
                continue;
            }
            "/compact" => {
                compact(&handle, true).await;
                continue;
            }
            "/save" => {
                match handle.save().await {
                    Ok(()) => eprintln!("  [saved {}]", handle.session_id()),
                    Err(e) => eprintln!("\x1b[31merror: {e}\x1b[0m"),
                }
                continue;
            }
            _ => {}
        }

        if let Some(command) = trimmed.strip_prefix('!') {
            run_tool(&handle, command).await;
            eprintln!("\x1b[2m{}\x1b[0m", handle.report_line());
            continue;
        }

        if let Err(e) = handle.append_item(ItemKind::UserMessage, "user", trimmed) {
            eprintln!("\x1b[31merror: {e}\x1b[0m");
            break;
        }

        let request = GenerateRequest {
            model: cli.model.clone(),
            max_tokens: handle.config().reserved_tokens(),
            system: cli.system.clone(),
            segments: handle.segments(),
        };
        match provider.generate(request).await {
            Ok(response) => {
                handle.record_turn_usage(response.usage);
                eprint!("\x1b[1;32magent>\x1b[0m ");
                println!("{}", response.text);
                if let Err(e) = handle.append_item(ItemKind::AssistantMessage, "assistant", response.text) {
                    eprintln!("\x1b[31merror: {e}\x1b[0m");
                    break;
                }
            }
            Err(e) if e.is_context_overflow() => {
                let report = handle.report_backend_rejection(&e);
                eprintln!(
                    "\x1b[31m  [backend rejected the request: estimated {} tokens, backend counted {:?}]\x1b[0m",
                    report.estimated_tokens, report.reported_tokens
                );
                compact(&handle, true).await;
            }
            Err(e) => eprintln!("\x1b[31merror: {e}\x1b[0m"),
        }

        eprintln!("\x1b[2m{}\x1b[0m", handle.report_line());
        compact(&handle, false).await;
    }

    if cli.session_dir.is_some() {
        if let Err(e) = handle.save().await {
            eprintln!("\x1b[31merror: {e}\x1b[0m");
        }
    }
}

async fn run_tool(handle: &SessionHandle, command: &str) {
    let output = match tokio::process::Command::new("sh").arg("-c").arg(command).output().await {
        Ok(output) => output,
        Err(e) => {
            eprintln!("\x1b[31merror: {e}\x1b[0m");
            return;
        }
    };
    let mut bytes = output.stdout;
    bytes.extend_from_slice(&output.stderr);
    match handle.append_tool_output("sh", &bytes) {
        Ok(receipt) => eprintln!(
            "\x1b[33m  [tool output: {} bytes, {} tokens{}]\x1b[0m",
            bytes.len(),
            receipt.tokens,
            if receipt.truncated { ", truncated" } else { "" }
        ),
        Err(e) => eprintln!("\x1b[31merror: {e}\x1b[0m"),
    }
}

async fn compact(handle: &SessionHandle, force: bool) {
    let result = if force {
        handle.compact_now().await
    } else {
        handle.request_compaction_if_needed().await
    };
    match result {
        Ok(CompactionOutcome::Compacted(report)) => {
            eprintln!(
                "\x1b[35m  [{} items summarized, {:.1}x compression]\x1b[0m",
                report.items_compacted, report.compression_ratio
            );
            eprintln!("\x1b[2m{}\x1b[0m", handle.report_line());
        }
        Ok(CompactionOutcome::NoOp) if force => eprintln!("  [nothing to compact]"),
        Ok(_) => {}
        // Already reported through the event stream.
        Err(_) => {}
    }
}

fn print_status(handle: &SessionHandle) {
    let snapshot = handle.snapshot();
    let turns = handle.turns();
    eprintln!("{snapshot}");
    eprintln!(
        "  items: {}  available: {}  signal: {}  compaction: {:?}",
        snapshot.item_count,
        snapshot.available_tokens,
        if snapshot.signal_latched { "latched" } else { "clear" },
        handle.compaction_state()
    );
    if !turns.is_empty() {
        eprintln!(
            "  turns: {}  avg tokens/turn: {}  ~{} turns left",
            turns.len(),
            turns.average_turn_tokens(),
            turns.estimated_remaining_turns(&snapshot)
        );
    }
}
