use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use git_split::config::{Config, Settings};
use git_split::credentials::{AddOutcome, CredentialStore};
use git_split::llm::Provider;
use git_split::logging;
use git_split::workflow::{self, DiffSource, ExecMode, SplitOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "git-split",
    about = "Split a messy diff into focused commits",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group the current changes by goal and commit each group
    Split(SplitArgs),
    /// Manage the pool of provider API keys
    #[command(name = "api-key", subcommand)]
    ApiKey(ApiKeyCommand),
    /// Show the saved settings, or change the default provider
    Config {
        #[arg(long)]
        provider: Option<Provider>,
    },
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Split the commits made since branching from this branch
    #[arg(short, long, conflicts_with = "diff_file")]
    target: Option<String>,

    /// Split a diff read from a file
    #[arg(short = 'f', long)]
    diff_file: Option<PathBuf>,

    /// gemini, openai or ollama (defaults to the configured provider)
    #[arg(short, long)]
    provider: Option<Provider>,

    /// Model name for the provider
    #[arg(long)]
    model: Option<String>,

    #[arg(short, long, value_enum, default_value_t = ExecMode::Normal)]
    mode: ExecMode,

    /// Execute the plan without asking
    #[arg(short, long, conflicts_with = "edit_plan")]
    execute: bool,

    /// Open the plan editor before executing
    #[arg(long)]
    edit_plan: bool,

    /// Extra context for the model, as text or a file path
    #[arg(short, long)]
    context: Option<String>,

    /// Command that must pass after the commits are created
    #[arg(long)]
    test_cmd: Option<String>,

    /// Name the goals yourself instead of asking a model
    #[arg(long)]
    manual: bool,
}

#[derive(Subcommand, Debug)]
enum ApiKeyCommand {
    /// Add a key to the pool
    Add {
        provider: Provider,
        key: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List pooled keys
    List {
        #[arg(long)]
        provider: Option<Provider>,
        /// Include deleted keys
        #[arg(long)]
        all: bool,
    },
    /// Remove a key from rotation
    Delete { id: i64 },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Split(args) => run_split(args).await,
        Commands::ApiKey(command) => run_api_key(command).map(|()| workflow::EXIT_OK),
        Commands::Config { provider } => run_config(provider).map(|()| workflow::EXIT_OK),
    };
    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run_split(args: SplitArgs) -> Result<i32> {
    let settings = Settings::from_env(&Config::load())?;

    let source = match (args.target, args.diff_file) {
        (Some(target), _) => DiffSource::Branch { target },
        (None, Some(path)) => DiffSource::File(path),
        (None, None) => DiffSource::WorkingTree,
    };
    let opts = SplitOptions {
        source,
        provider: args.provider,
        model: args.model,
        mode: args.mode,
        execute: args.execute,
        edit_plan: args.edit_plan,
        context: args.context,
        test_cmd: args.test_cmd,
        manual: args.manual,
    };

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted; finishing the current step. Press Ctrl-C again to quit now.");
            watcher.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(workflow::EXIT_INTERRUPTED);
            }
        }
    });

    workflow::run_split(opts, &settings, cancel).await
}

fn run_api_key(command: ApiKeyCommand) -> Result<()> {
    let settings = Settings::from_env(&Config::load())?;
    let store = CredentialStore::open(&settings.database_path).with_context(|| {
        format!(
            "Failed to open the key database at {}",
            settings.database_path.display()
        )
    })?;

    match command {
        ApiKeyCommand::Add {
            provider,
            key,
            name,
        } => {
            if !provider.requires_key() {
                bail!("{} does not use API keys", provider);
            }
            let key = key.trim();
            if key.is_empty() {
                bail!("The key is empty");
            }
            match store.add(provider.as_str(), key, name.as_deref(), Utc::now())? {
                AddOutcome::Added(id) => println!("Added {} key #{}.", provider, id),
                AddOutcome::Reactivated(id) => {
                    println!("Key #{} was deleted before; it is active again.", id)
                }
                AddOutcome::Duplicate => println!("That {} key is already in the pool.", provider),
            }
        }
        ApiKeyCommand::List { provider, all } => {
            let keys = store.list(provider.as_ref().map(Provider::as_str), all)?;
            if keys.is_empty() {
                println!("No API keys stored.");
                return Ok(());
            }
            for key in keys {
                let last_used = key
                    .last_used
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<6} {:<8} {:<24} {}  used {}x, last {}{}",
                    format!("#{}", key.id),
                    key.provider,
                    key.name.as_deref().unwrap_or("-"),
                    key.masked_secret(),
                    key.use_count,
                    last_used,
                    if key.active { "" } else { "  (deleted)" }
                );
            }
        }
        ApiKeyCommand::Delete { id } => {
            if store.deactivate(id)? {
                println!("Key #{} removed from rotation.", id);
            } else {
                bail!("No active key with id {}", id);
            }
        }
    }
    Ok(())
}

fn run_config(provider: Option<Provider>) -> Result<()> {
    let mut config = Config::load();
    if let Some(provider) = provider {
        config.default_provider = Some(provider.to_string());
        config.save()?;
        println!("Default provider set to {}.", provider);
    }
    println!("Config file: {}", Config::config_location());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
