use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use ytui::cache::{CacheStorage, FieldMutation, JsonFileStorage, NoopStorage, Reconciler};
use ytui::config::{self, Config};
use ytui::logging;
use ytui::youtrack::params::{Fields, SearchOptions};
use ytui::youtrack::types::{FieldValue, Issue, ValueRecord};
use ytui::youtrack::YouTrackClient;

#[derive(Parser, Debug)]
#[command(name = "ytui")]
#[command(about = "A terminal client for YouTrack")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ytui/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List issues: the cached snapshot first, then the fresh one
  Issues {
    /// Project short name to scope the search to
    #[arg(short, long)]
    project: Option<String>,
    /// YouTrack search query (default from config)
    #[arg(short, long)]
    query: Option<String>,
  },
  /// Show one issue
  Show { issue: String },
  /// List projects
  Projects,
  /// List agile boards and their current sprints
  Boards,
  /// Comment on an issue
  Comment { issue: String, text: String },
  /// Set a custom field on an issue, e.g. `set-field DEMO-17 State 58-3 --name Fixed`
  SetField {
    issue: String,
    field: String,
    /// Id of the value record to set
    value_id: String,
    /// Display name of the value, shown until the next fetch
    #[arg(long)]
    name: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config::data_dir()?)?;

  let client = YouTrackClient::new(&config)?;
  let command = args.command.unwrap_or(Command::Issues {
    project: None,
    query: None,
  });

  if config.cache.enabled {
    let storage = Arc::new(JsonFileStorage::new(config.cache.issues_path()?));
    run(command, &config, client, storage).await
  } else {
    run(command, &config, client, Arc::new(NoopStorage)).await
  }
}

async fn run<S: CacheStorage + 'static>(
  command: Command,
  config: &Config,
  client: YouTrackClient,
  storage: Arc<S>,
) -> Result<()> {
  match command {
    Command::Issues { project, query } => {
      let mut issues = issue_reconciler(config, client, storage, project, query);
      issues.start();
      if issues.data().is_some() {
        print_issues("cached", &issues);
      }

      while issues.wait().await {}
      report(&issues)?;
      print_issues("fresh", &issues);
      issues.flush_cache().await;
    }
    Command::Show { issue } => {
      let issue = client.get_issue(&issue, &Fields::Default).await?;
      println!(
        "{} [{}] {}",
        issue.id_readable.as_deref().unwrap_or(&issue.id),
        issue.state_name().unwrap_or("-"),
        issue.summary.as_deref().unwrap_or("")
      );
      if let Some(assignee) = issue.assignee.as_ref().and_then(|u| u.full_name.as_deref()) {
        println!("assignee: {}", assignee);
      }
      if let Some(description) = &issue.description {
        println!("\n{}", description);
      }
    }
    Command::Boards => {
      for board in client.list_boards().await? {
        let sprint = client.current_sprint(&board.id).await?;
        println!(
          "{:<24} {}",
          board.name.as_deref().unwrap_or(&board.id),
          sprint
            .and_then(|s| s.name)
            .unwrap_or_else(|| "(no current sprint)".to_string())
        );
      }
    }
    Command::Comment { issue, text } => {
      let comment = client.add_comment(&issue, &text).await?;
      println!("comment {} added to {}", comment.id, issue);
    }
    Command::Projects => {
      let projects = client.list_projects(&Fields::Default).await?;
      for project in projects {
        println!(
          "{:<12} {}",
          project.short_name.as_deref().unwrap_or("-"),
          project.name.as_deref().unwrap_or("")
        );
      }
    }
    Command::SetField {
      issue,
      field,
      value_id,
      name,
    } => {
      let value = FieldValue::One(ValueRecord {
        id: Some(value_id),
        name,
        ..Default::default()
      });

      let mut issues = issue_reconciler(config, client.clone(), storage, None, None);
      issues.start();

      let remote = {
        let (issue, field, value) = (issue.clone(), field.clone(), value.clone());
        async move { client.update_custom_field(&issue, &field, &value).await }
      };
      let known = issues.apply_mutation(FieldMutation::new(&issue, &field, value), remote);
      if !known {
        tracing::info!(%issue, "issue not in cached snapshot, applying after fetch");
      }

      while issues.wait().await {}
      issues.flush_cache().await;
      if let Some(failure) = issues.take_failed_mutations().into_iter().next() {
        return Err(eyre!("Failed to update {} on {}: {}", field, issue, failure.error));
      }
      if let Some(e) = issues.fetch_error() {
        eprintln!("warning: could not refresh issues: {}", e);
      }
      println!("{} {} updated", issue, field);
    }
  }

  Ok(())
}

fn issue_reconciler<S: CacheStorage + 'static>(
  config: &Config,
  client: YouTrackClient,
  storage: Arc<S>,
  project: Option<String>,
  query: Option<String>,
) -> Reconciler<Issue, S> {
  let project = project.or_else(|| config.default_project.clone());
  let query = query.unwrap_or_else(|| config.default_query.clone());
  let options = SearchOptions::page(config.page_size);

  Reconciler::new(storage, move || {
    let client = client.clone();
    let project = project.clone();
    let query = query.clone();
    let options = options.clone();
    async move {
      match project {
        Some(p) => client.search_project_issues(&p, &query, &options).await,
        None => client.search_issues(&query, &options).await,
      }
    }
  })
}

fn report<S: CacheStorage + 'static>(issues: &Reconciler<Issue, S>) -> Result<()> {
  match issues.fetch_error() {
    Some(e) if issues.data().is_some() => {
      eprintln!("warning: {} (showing cached data)", e);
      Ok(())
    }
    Some(e) => Err(eyre!("{}", e)),
    None => Ok(()),
  }
}

fn print_issues<S: CacheStorage + 'static>(label: &str, issues: &Reconciler<Issue, S>) {
  let total = issues
    .data()
    .and_then(|d| d.total)
    .map_or_else(|| "?".to_string(), |t| t.to_string());
  let age = issues
    .published_at()
    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
    .unwrap_or_default();
  println!("-- {} ({} of {}) {}", label, issues.records().len(), total, age);

  for issue in issues.records() {
    println!(
      "{:<12} {:<14} {}",
      issue.id_readable.as_deref().unwrap_or(&issue.id),
      issue.state_name().unwrap_or("-"),
      issue.summary.as_deref().unwrap_or("")
    );
  }
}
