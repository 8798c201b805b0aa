//! hearth: console chat over a local model.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger once (stderr, or the configured log file)
//!   4. Build the session (backend, transcript store, speech)
//!   5. Load the startup model: argv[1], else `[model] path`
//!   6. Read stdin until `/quit`, EOF or Ctrl-C
//!   7. Shut the session down

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hearth::config;
use hearth::error::AppError;
use hearth::logger::{self, LogTarget};
use hearth::models::{self, ModelFile};
use hearth::session::{Generation, GenerationOutcome, LoadOutcome, Session};
use hearth::settings::LiveSettings;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Optional file.
    let _ = dotenvy::dotenv();

    let config = config::load()?;

    logger::parse_level(&config.log_level)?;
    match &config.log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            logger::init(&config.log_level, LogTarget::File(path))?;
        }
        None => logger::init(&config.log_level, LogTarget::Stderr)?,
    }

    info!(
        name = %config.name,
        work_dir = %config.work_dir.display(),
        log_level = %config.log_level,
        backend = %config.model.backend,
        "config loaded"
    );

    let settings = Arc::new(LiveSettings::from_config(&config));
    let session = Session::from_config(&config, settings)?;

    let startup_model = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.model.path.clone());
    if let Some(path) = startup_model {
        load(&session, &path).await;
    }

    let library = models::library_dir(&config.work_dir);
    let result = console(&session, &library).await;
    session.shutdown().await;
    result
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Chat(&'a str),
    Load(&'a str),
    Models,
    Unload,
    Cancel,
    Status,
    History,
    Clear,
    Help,
    Quit,
    Unknown(&'a str),
    Empty,
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Chat(line);
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("load", "") => Command::Unknown(line),
            ("load", path) => Command::Load(path),
            ("models", _) => Command::Models,
            ("unload", _) => Command::Unload,
            ("cancel", _) => Command::Cancel,
            ("status", _) => Command::Status,
            ("history", _) => Command::History,
            ("clear", _) => Command::Clear,
            ("help", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            _ => Command::Unknown(line),
        }
    }
}

const HELP: &str = "\
commands:
  /models        list the model library
  /load <path>   load a model file
  /load <n>      load entry n of the last /models listing
  /unload        unload the current model
  /cancel        stop the running reply
  /status        show model and generation state
  /history       print the transcript
  /clear         delete the transcript
  /quit          exit
anything else is sent as a chat message";

// ── Console loop ──────────────────────────────────────────────────────────────

async fn console(session: &Session, library: &Path) -> Result<(), AppError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer: Option<JoinHandle<()>> = None;
    let mut listed: Vec<ModelFile> = Vec::new();
    println!("{HELP}");

    loop {
        tokio::select! {
            biased;

            signal = tokio::signal::ctrl_c() => {
                signal?;
                if session.cancel_generation() {
                    info!("ctrl-c: generation cancelled");
                    continue;
                }
                info!("ctrl-c received, shutting down");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                match Command::parse(&line) {
                    Command::Empty => {}
                    Command::Quit => break,
                    Command::Help => println!("{HELP}"),
                    Command::Chat(text) => match session.send_message(text).await {
                        Ok(generation) => printer = Some(tokio::spawn(stream(generation))),
                        Err(e) => eprintln!("! {e}"),
                    },
                    Command::Load(arg) => load(session, &load_target(arg, &listed)).await,
                    Command::Models => match models::scan(library) {
                        Ok(found) => {
                            print_library(session, library, &found);
                            listed = found;
                        }
                        Err(e) => eprintln!("! {e}"),
                    },
                    Command::Unload => match session.unload_model().await {
                        Ok(()) => println!("model unloaded"),
                        Err(e) => eprintln!("! {e}"),
                    },
                    Command::Cancel => {
                        if !session.cancel_generation() {
                            println!("nothing to cancel");
                        }
                    }
                    Command::Status => status(session),
                    Command::History => match session.history().await {
                        Ok(messages) => {
                            for m in messages {
                                println!("[{}] {}", m.role, m.content);
                            }
                        }
                        Err(e) => eprintln!("! {e}"),
                    },
                    Command::Clear => match session.clear_history().await {
                        Ok(()) => println!("history cleared"),
                        Err(e) => eprintln!("! {e}"),
                    },
                    Command::Unknown(text) => eprintln!("! unknown command: {text} (try /help)"),
                }
            }
        }
    }

    if let Some(printer) = printer {
        if !printer.is_finished() {
            session.cancel_generation();
        }
        if let Err(e) = printer.await {
            warn!("output task failed: {e}");
        }
    }
    Ok(())
}

async fn load(session: &Session, path: &Path) {
    println!("loading {} ...", path.display());
    match session.load_model(path).await {
        Ok(LoadOutcome::Loaded(info)) => println!(
            "loaded {} ({}, {} bytes, ctx {})",
            info.name, info.parameter_class, info.size_bytes, info.context_size
        ),
        Ok(LoadOutcome::AlreadyLoaded(info)) => println!("{} is already loaded", info.name),
        Err(e) => eprintln!("! {e}"),
    }
}

/// `/load 2` picks the second entry of the last `/models` listing.
fn load_target(arg: &str, listed: &[ModelFile]) -> PathBuf {
    match arg.parse::<usize>() {
        Ok(n) if (1..=listed.len()).contains(&n) => listed[n - 1].path.clone(),
        _ => PathBuf::from(arg),
    }
}

fn print_library(session: &Session, library: &Path, found: &[ModelFile]) {
    if found.is_empty() {
        println!("no models in {}", library.display());
        return;
    }
    let loaded = session.model_info().map(|info| info.path);
    for (i, model) in found.iter().enumerate() {
        let mark = if loaded.as_ref() == Some(&model.path) { '*' } else { ' ' };
        let modified = model
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{mark}{:>3}. {}  ({}, {}, {modified})",
            i + 1,
            model.name,
            model.parameter_class,
            models::format_size(model.size_bytes)
        );
    }
}

fn status(session: &Session) {
    let model = match session.model_info() {
        Some(info) => format!("{} ({})", info.name, info.parameter_class),
        None => "-".into(),
    };
    println!(
        "model: {} [{}]  generation: {}",
        model,
        session.model_state(),
        session.generation_state()
    );
}

/// Print one reply as it streams, then its terminal outcome.
async fn stream(mut generation: Generation) {
    let mut out = tokio::io::stdout();
    while let Some(token) = generation.next_token().await {
        let _ = out.write_all(token.as_bytes()).await;
        let _ = out.flush().await;
    }
    let tail = match generation.outcome().await {
        GenerationOutcome::Completed(_) => "\n".to_string(),
        GenerationOutcome::Cancelled(_) => "\n[cancelled]\n".to_string(),
        GenerationOutcome::Failed(e) => format!("\n[failed: {e}]\n"),
    };
    let _ = out.write_all(tail.as_bytes()).await;
    let _ = out.flush().await;
}
