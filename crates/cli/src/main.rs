use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use cli::{DaemonClient, format::print_envelope, logging};
use daemon::{Daemon, default_socket_path};
use foldex_core::{Config, FolderConfig, default_config_file, default_data_dir};
use serde_json::{Value, json};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "foldex", version, about = "Folder-scoped semantic search indexer")]
struct Cli {
  /// Path to config.toml (defaults to the user config directory)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Daemon socket path
  #[arg(long, global = true)]
  socket: Option<PathBuf>,

  /// Verbose logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run the indexing daemon
  Daemon,
  /// Index configured folders (or one folder by name)
  Index {
    /// Folder name or path; all configured folders when omitted
    folder: Option<String>,
    /// Bypass change detection and reprocess everything
    #[arg(long)]
    force: bool,
    /// Override the scheduler fan-out ceiling
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// Emit the raw JSON envelope
    #[arg(long)]
    json: bool,
  },
  /// Search indexed folders
  Search {
    query: String,
    /// Restrict to one folder by name
    #[arg(long)]
    folder: Option<String>,
    #[arg(long, default_value_t = 10)]
    top_k: usize,
    #[arg(long, default_value_t = 0.0)]
    threshold: f32,
    /// Restrict by file type (text, markdown, pdf, word, spreadsheet, presentation)
    #[arg(long)]
    file_type: Option<String>,
    #[arg(long)]
    json: bool,
  },
  /// Show indexing status
  Status {
    #[arg(long)]
    folder: Option<String>,
    #[arg(long)]
    json: bool,
  },
  /// Manage configured folders
  Folders {
    #[command(subcommand)]
    action: Option<FoldersAction>,
  },
  /// Cancel running indexing jobs
  Cancel {
    folder: Option<String>,
    #[arg(long)]
    json: bool,
  },
  /// Show recent daemon log output
  Logs {
    /// Trailing lines to print
    #[arg(long, default_value_t = 50)]
    lines: usize,
  },
}

#[derive(Subcommand, Clone)]
enum FoldersAction {
  /// List configured folders
  List {
    #[arg(long)]
    json: bool,
  },
  /// Add a folder to the configuration
  Add {
    path: PathBuf,
    /// Display name (defaults to the directory name)
    #[arg(long)]
    name: Option<String>,
    /// Embedding model id override (provider:model-name)
    #[arg(long)]
    model: Option<String>,
    /// Extra exclude globs (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
  },
  /// Remove a folder from the configuration by name or path
  Remove { folder: String },
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<Config> {
  match path {
    Some(p) => Config::load(p).with_context(|| format!("loading config {}", p.display())),
    None => Config::load_default().context("loading default config"),
  }
}

/// Route a tool call through the running daemon when one is listening,
/// otherwise run it in-process against the same code paths.
async fn call_tool(cli: &Cli, method: &str, params: Value) -> anyhow::Result<Value> {
  let socket = cli.socket.clone().unwrap_or_else(default_socket_path);

  if let Some(mut client) = DaemonClient::connect(&socket).await {
    return client.call(method, params).await;
  }

  let config = load_config(&cli.config)?;
  let daemon = Daemon::new(config);
  let envelope = match method {
    "search" => daemon.tools().search(params).await,
    "status" => daemon.tools().status(params).await,
    "list_folders" => daemon.tools().list_folders().await,
    "index" => daemon.tools().index_folders(params).await,
    "cancel" => daemon.tools().cancel(params).await,
    other => anyhow::bail!("unknown method: {other}"),
  };
  Ok(serde_json::to_value(&envelope)?)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
  match &cli.command {
    Command::Daemon => {
      let _guard = logging::init_daemon(cli.verbose).context("initializing daemon logging")?;
      let config = load_config(&cli.config)?;
      let socket = cli.socket.clone().unwrap_or_else(default_socket_path);
      let daemon = Daemon::new(config);
      daemon.run(socket).await.context("daemon failed")?;
      Ok(0)
    }

    Command::Index {
      folder,
      force,
      max_concurrent,
      json,
    } => {
      logging::init(cli.verbose);
      let mut params = json!({ "force": force });
      if let Some(folder) = folder {
        params["folder"] = json!(folder);
      }
      if let Some(n) = max_concurrent {
        params["max_concurrent_folders"] = json!(n);
      }
      let envelope = call_tool(&cli, "index", params).await?;
      Ok(print_envelope(&envelope, *json))
    }

    Command::Search {
      query,
      folder,
      top_k,
      threshold,
      file_type,
      json,
    } => {
      logging::init(cli.verbose);
      let mut params = json!({ "query": query, "top_k": top_k, "threshold": threshold });
      if let Some(folder) = folder {
        params["folder"] = json!(folder);
      }
      if let Some(file_type) = file_type {
        params["file_type"] = json!(file_type);
      }
      let envelope = call_tool(&cli, "search", params).await?;
      Ok(print_envelope(&envelope, *json))
    }

    Command::Status { folder, json } => {
      logging::init(cli.verbose);
      let mut params = json!({});
      if let Some(folder) = folder {
        params["folder"] = json!(folder);
      }
      let envelope = call_tool(&cli, "status", params).await?;
      Ok(print_envelope(&envelope, *json))
    }

    Command::Folders { action } => {
      logging::init(cli.verbose);
      let action = action.clone().unwrap_or(FoldersAction::List { json: false });
      match action {
        FoldersAction::List { json } => {
          let envelope = call_tool(&cli, "list_folders", json!({})).await?;
          Ok(print_envelope(&envelope, json))
        }
        FoldersAction::Add {
          path,
          name,
          model,
          exclude,
        } => {
          let resolved = path
            .canonicalize()
            .with_context(|| format!("cannot resolve folder path {}", path.display()))?;

          let file = cli.config.clone().unwrap_or_else(default_config_file);
          let mut config = load_config(&cli.config)?;
          if config
            .folders
            .iter()
            .any(|f| f.resolved_path().map(|p| p == resolved).unwrap_or(false))
          {
            bail!("folder already configured: {}", resolved.display());
          }

          let mut folder = FolderConfig::new(path);
          if let Some(name) = name {
            folder.name = name;
          }
          folder.model = model;
          folder.exclude = exclude;
          let display = folder.display_name();
          config.folders.push(folder);
          config.save(&file)?;

          println!("added {display} ({})", resolved.display());
          Ok(0)
        }
        FoldersAction::Remove { folder } => {
          let file = cli.config.clone().unwrap_or_else(default_config_file);
          let mut config = load_config(&cli.config)?;

          let before = config.folders.len();
          config
            .folders
            .retain(|f| f.display_name() != folder && f.path != PathBuf::from(&folder));
          if config.folders.len() == before {
            bail!("unknown folder: {folder}");
          }
          config.save(&file)?;

          println!("removed {folder} ({} folders remain)", config.folders.len());
          Ok(0)
        }
      }
    }

    Command::Logs { lines } => {
      logging::init(cli.verbose);
      print_recent_logs(*lines)
    }

    Command::Cancel { folder, json } => {
      logging::init(cli.verbose);
      let mut params = json!({});
      if let Some(folder) = folder {
        params["folder"] = json!(folder);
      }
      let envelope = call_tool(&cli, "cancel", params).await?;
      Ok(print_envelope(&envelope, *json))
    }
  }
}

/// Print the tail of the newest daily log file.
fn print_recent_logs(lines: usize) -> anyhow::Result<i32> {
  let log_dir = default_data_dir().join("logs");

  // Daily files are named foldex.log.YYYY-MM-DD, so the lexicographic
  // maximum is the newest
  let newest = std::fs::read_dir(&log_dir)
    .ok()
    .into_iter()
    .flatten()
    .flatten()
    .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
    .max_by_key(|entry| entry.file_name());

  let Some(entry) = newest else {
    eprintln!("no logs found under {}", log_dir.display());
    return Ok(0);
  };

  let content = std::fs::read_to_string(entry.path())
    .with_context(|| format!("reading {}", entry.path().display()))?;
  let all: Vec<&str> = content.lines().collect();
  let start = all.len().saturating_sub(lines);
  for line in &all[start..] {
    println!("{line}");
  }
  Ok(0)
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  match run(cli).await {
    Ok(code) => std::process::exit(code),
    Err(e) => {
      // Failure always carries a JSON error envelope on stdout
      let envelope = json!({
        "data": null,
        "status": { "code": "error", "message": e.to_string() },
        "continuation": { "has_more": false },
      });
      println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
      eprintln!("error: {e:#}");
      std::process::exit(1);
    }
  }
}
