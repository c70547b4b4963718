use chatsync::cache::{DataSource, SqliteStorage};
use chatsync::config::Config;
use chatsync::remote::HttpRemoteStore;
use chatsync::types::{Department, EntityFamily, NewProject, ProjectPatch, Role};
use chatsync::{logging, Fetched, SyncCoordinator, SyncOptions};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "chatsync")]
#[command(about = "Offline-first sync for conversations, messages and projects")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chatsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List conversations, optionally only those of one project
  Conversations {
    #[arg(long)]
    project: Option<String>,
  },
  NewConversation {
    title: String,
    #[arg(long)]
    project: Option<String>,
  },
  Rename {
    id: String,
    title: String,
  },
  /// Delete a conversation and its messages
  DeleteConversation {
    id: String,
  },
  /// List the messages of a conversation, oldest first
  Messages {
    conversation: String,
  },
  Send {
    conversation: String,
    content: String,
    /// user or assistant
    #[arg(long, default_value = "user")]
    role: Role,
  },
  Projects,
  NewProject {
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    department: Option<Department>,
    #[arg(long)]
    instructions: Option<String>,
  },
  UpdateProject {
    id: String,
    #[arg(long)]
    name: Option<String>,
    /// Empty string clears the description
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    department: Option<Department>,
    /// Empty string clears the instructions
    #[arg(long)]
    instructions: Option<String>,
    #[arg(long)]
    memory: Option<String>,
  },
  DeleteProject {
    id: String,
  },
  /// Overwrite the local cache from the remote (conversation, message or project)
  Resync {
    family: EntityFamily,
    owner: Option<String>,
  },
  GetSetting {
    key: String,
  },
  /// Value is parsed as JSON, falling back to a plain string
  SetSetting {
    key: String,
    value: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = match logging::default_log_dir() {
    Some(dir) => Some(logging::init(&dir)?),
    None => None,
  };

  let storage = match &config.cache.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  let remote = HttpRemoteStore::new(&config.remote, Config::get_api_key()?)?;
  let sync =
    SyncCoordinator::new(storage, Arc::new(remote)).with_options(SyncOptions::from(&config.sync));

  run(&sync, args.command).await
}

async fn run(sync: &SyncCoordinator<SqliteStorage>, command: Command) -> Result<()> {
  match command {
    Command::Conversations { project } => {
      print_listing(sync.list_conversations(project.as_deref()).await?)
    }
    Command::NewConversation { title, project } => {
      print_json(&sync.create_conversation(&title, project.as_deref()).await?)
    }
    Command::Rename { id, title } => print_json(&sync.rename_conversation(&id, &title).await?),
    Command::DeleteConversation { id } => {
      sync.delete_conversation(&id).await?;
      Ok(())
    }
    Command::Messages { conversation } => print_listing(sync.list_messages(&conversation).await?),
    Command::Send {
      conversation,
      content,
      role,
    } => print_json(&sync.append_message(&conversation, role, &content).await?),
    Command::Projects => print_listing(sync.list_projects().await?),
    Command::NewProject {
      name,
      description,
      department,
      instructions,
    } => {
      let mut new = NewProject::new(name);
      if let Some(description) = description {
        new = new.with_description(description);
      }
      if let Some(department) = department {
        new = new.with_department(department);
      }
      if let Some(instructions) = instructions {
        new = new.with_instructions(instructions);
      }
      print_json(&sync.create_project(new).await?)
    }
    Command::UpdateProject {
      id,
      name,
      description,
      department,
      instructions,
      memory,
    } => {
      let patch = ProjectPatch {
        name,
        description,
        department,
        instructions,
        memory_context: memory,
      };
      print_json(&sync.update_project(&id, patch).await?)
    }
    Command::DeleteProject { id } => {
      sync.delete_project(&id).await?;
      Ok(())
    }
    Command::Resync { family, owner } => {
      sync.force_resync(family, owner.as_deref()).await?;
      Ok(())
    }
    Command::GetSetting { key } => print_json(&sync.get_setting(&key)?),
    Command::SetSetting { key, value } => {
      let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
      sync.set_setting(&key, &value)?;
      Ok(())
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_listing<T: Serialize>(fetched: Fetched<T>) -> Result<()> {
  let listing = fetched
    .current()
    .ok_or_else(|| eyre!("read was superseded by a newer one"))?;
  if listing.source != DataSource::Remote {
    eprintln!("remote unavailable, showing cached data");
  }
  print_json(&listing.data)
}
