use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use zist::cache::CommandCache;
use zist::config::Config;
use zist::db::Database;
use zist::history::format_timestamp;
use zist::ingest::{self, FileOutcome};
use zist::llm::OpenAiClient;
use zist::query::{QueryEngine, SearchRequest, DEFAULT_LIMIT};
use zist::wizard::{Provenance, Wizard, WizardRequest};
use zist::{integration, selector, Result};

#[derive(Parser, Debug)]
#[command(author, version, about = "Local zsh history aggregation and search")]
struct Args {
    #[arg(long, global = true, help = "SQLite database path", value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Collect commands from zsh history files (default: ~/.histories)
    Collect {
        #[arg(short, long, help = "Only report errors")]
        quiet: bool,

        #[arg(help = "History files or directories to scan")]
        paths: Vec<PathBuf>,
    },

    /// Search command history interactively with fzf
    Search {
        #[arg(help = "Full-text query, each word matched as a prefix")]
        query: Option<String>,

        #[arg(long, default_value_t = DEFAULT_LIMIT, help = "Maximum number of results")]
        limit: usize,

        #[arg(long, help = "Only commands at or after this date (YYYY-MM-DD or YYYY-MM-DD HH:MM:SS)")]
        since: Option<String>,

        #[arg(long, help = "Only commands at or before this date (YYYY-MM-DD or YYYY-MM-DD HH:MM:SS)")]
        until: Option<String>,

        #[arg(long, help = "Print results instead of opening fzf")]
        print: bool,
    },

    /// Turn a natural-language request into a shell command
    Wizard {
        #[arg(long, help = "What you want to do")]
        query: Option<String>,

        #[arg(long, help = "Working directory to mention in the prompt")]
        pwd: Option<String>,

        #[arg(long, help = "Print the result as JSON")]
        json: bool,

        #[arg(long, value_name = "QUERY", requires = "command", help = "Remember that COMMAND was run for QUERY")]
        confirm: Option<String>,

        #[arg(long, help = "Command to remember with --confirm")]
        command: Option<String>,

        #[arg(long, value_name = "N", help = "List N cached requests")]
        list: Option<usize>,

        #[arg(long, help = "Remove every cached request")]
        clear: bool,

        #[arg(long, value_name = "QUERY", help = "Remove one cached request")]
        delete: Option<String>,
    },

    /// Show database statistics
    Stats,

    /// Rebuild and check the full-text index
    Reindex,

    /// Install zsh integration (Ctrl+X binding and precmd hook)
    Install,

    /// Remove zsh integration
    Uninstall,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ZIST_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    match args.command {
        Cmd::Collect { quiet, paths } => handle_collect(&config, paths, quiet),
        Cmd::Search { query, limit, since, until, print } => {
            let request = SearchRequest { query, since, until, limit };
            handle_search(&config, &request, print)
        }
        Cmd::Wizard { query, pwd, json, confirm, command, list, clear, delete } => {
            let db = Database::open(&config.db_path)?;
            if clear {
                let removed = CommandCache::new(&db).clear()?;
                println!("✓ Cleared {} cached request(s)", removed);
            } else if let Some(query) = delete {
                if CommandCache::new(&db).delete(&query)? {
                    println!("✓ Removed '{}'", query.trim());
                } else {
                    println!("No cached request for '{}'", query.trim());
                }
            } else if let Some(limit) = list {
                handle_cache_list(&db, limit)?;
            } else if let (Some(query), Some(command)) = (confirm, command) {
                Wizard::new(&db, None).confirm(&query, &command)?;
            } else {
                let pwd = pwd.or_else(|| env::current_dir().ok().map(|p| p.to_string_lossy().to_string()));
                handle_wizard(&db, &config, query.unwrap_or_default(), pwd, json)?;
            }
            Ok(())
        }
        Cmd::Stats => {
            let db = Database::open(&config.db_path)?;
            print_stats(&db, true)
        }
        Cmd::Reindex => {
            let db = Database::open(&config.db_path)?;
            db.rebuild_index()?;
            db.check_index()?;
            println!("✓ Full-text index rebuilt");
            Ok(())
        }
        Cmd::Install => {
            if integration::install()? {
                println!("✓ zsh integration installed");
                println!("  Run: source ~/.zshrc, then press Ctrl+X to search history");
            } else {
                println!("zsh integration already installed");
                println!("  To reinstall, run: zist uninstall && zist install");
            }
            Ok(())
        }
        Cmd::Uninstall => {
            if integration::uninstall()? {
                println!("✓ zsh integration removed");
            } else {
                println!("zsh integration not found");
            }
            Ok(())
        }
    }
}

fn handle_collect(config: &Config, paths: Vec<PathBuf>, quiet: bool) -> Result<()> {
    let paths = if paths.is_empty() { config.history_paths.clone() } else { paths };

    if !quiet {
        println!("Collecting from {} path(s) into DB: {}", paths.len(), config.db_path.display());
    }

    let mut db = Database::open(&config.db_path)?;
    let report = ingest::collect(&mut db, &paths)?;

    for outcome in &report.files {
        match outcome {
            FileOutcome::Ingested { path, parsed, inserted, skipped } => {
                if !quiet {
                    println!("{}: {} parsed, {} new, {} skipped", path.display(), parsed, inserted, skipped);
                }
            }
            FileOutcome::Failed { error, .. } => {
                eprintln!("Warning: {}", error);
            }
        }
    }

    if !quiet {
        println!();
        print_stats(&db, false)?;
        println!("\nCollection complete: {} new, {} skipped", report.inserted(), report.skipped());
    }
    Ok(())
}

fn handle_search(config: &Config, request: &SearchRequest, print: bool) -> Result<()> {
    let results = {
        let db = Database::open(&config.db_path)?;
        QueryEngine::new(&db).search(request)?
    };

    if print {
        for result in &results {
            println!("{}\t{}\t{}", format_timestamp(result.timestamp), result.origin, result.text);
        }
        return Ok(());
    }

    if let Some(command) = selector::select(&results)? {
        println!("{}", command);
    }
    Ok(())
}

fn handle_wizard(db: &Database, config: &Config, query: String, pwd: Option<String>, json: bool) -> Result<()> {
    let client = OpenAiClient::new(config.llm.clone());
    let wizard = Wizard::new(db, Some(&client)).with_timeout(config.llm.timeout);

    let response = wizard.generate(&WizardRequest { query, pwd })?;

    if json {
        println!("{}", response.to_json()?);
    } else {
        if response.source == Provenance::Cache {
            eprintln!("(cached)");
        }
        println!("{}", response.command);
    }
    Ok(())
}

fn handle_cache_list(db: &Database, limit: usize) -> Result<()> {
    let entries = CommandCache::new(db).list(limit)?;
    if entries.is_empty() {
        println!("No cached requests");
        return Ok(());
    }

    for entry in entries {
        println!("[{}] ({}x) {}", format_timestamp(entry.last_used), entry.run_count, entry.original_query);
        println!("  {}", entry.command);
    }
    Ok(())
}

fn print_stats(db: &Database, per_origin: bool) -> Result<()> {
    let stats = db.stats()?;
    println!("Database stats:");
    println!("  Total commands: {}", stats.total_records);
    println!("  Total sources: {}", stats.distinct_origins);

    if per_origin {
        for (origin, count) in &stats.per_origin {
            println!("  {:>8}  {}", count, shorten_path(origin));
        }
    }
    Ok(())
}

fn shorten_path(path: &str) -> String {
    if let Some(home) = dirs::home_dir() {
        let home_str = home.to_string_lossy();
        if path.starts_with(home_str.as_ref()) {
            return path.replacen(home_str.as_ref(), "~", 1);
        }
    }
    path.to_string()
}
