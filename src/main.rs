mod app;
mod cache;
mod clock;
mod config;
mod firestore;
mod logging;
mod model;
mod store;
mod sw;

use chrono::{Duration, Local};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use url::Url;

use crate::sw::{Destination, FetchOutcome, Request, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "meowlog")]
#[command(about = "Offline-first cache core for the Meow Log pet tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/meowlog/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Raw access to the persistent key/value cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// The signed-in family's pets
  #[command(subcommand)]
  Pets(PetsCommand),
  /// The signed-in user's family
  #[command(subcommand)]
  Family(FamilyCommand),
  /// Drive the service worker's events
  #[command(subcommand)]
  Sw(SwCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get {
    key: String,
    /// Treat entries older than this as absent
    #[arg(long)]
    max_age_ms: Option<i64>,
  },
  Set {
    key: String,
    /// JSON value to store
    value: String,
  },
  Del {
    key: String,
  },
}

#[derive(Subcommand, Debug)]
enum PetsCommand {
  List {
    /// Skip the cache and go to the remote
    #[arg(long)]
    refresh: bool,
  },
  Show {
    id: String,
    #[arg(long)]
    refresh: bool,
  },
  /// Age in whole years for a birth date
  Age { birth_date: String },
}

#[derive(Subcommand, Debug)]
enum FamilyCommand {
  Show {
    #[arg(long)]
    refresh: bool,
  },
  /// Start a new family with yourself as admin
  Create { name: String },
  Join { family_id: String },
  Leave,
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
  #[arg(long, value_enum, default_value_t = Destination::Empty)]
  destination: Destination,
  /// Treat as a top-level document navigation
  #[arg(long)]
  navigate: bool,
}

impl RequestArgs {
  fn build(&self, url: &str) -> Result<Request> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
    let request = Request::get(url).with_destination(self.destination);
    Ok(if self.navigate { request.navigate() } else { request })
  }
}

#[derive(Subcommand, Debug)]
enum SwCommand {
  /// Precache the app shell
  Install,
  /// Remove partitions of older versions
  Activate,
  /// Intercept one request
  Fetch {
    url: String,
    #[command(flatten)]
    request: RequestArgs,
  },
  /// Show which route each URL would take, without fetching
  Route {
    #[arg(required = true)]
    urls: Vec<String>,
    #[command(flatten)]
    request: RequestArgs,
  },
  /// Deliver a push message
  Push { payload: String },
  /// Fire a background sync
  Sync { tag: String },
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

async fn run_cache(app: &app::App, command: CacheCommand) -> Result<()> {
  let cache = app.cache.cache();
  match command {
    CacheCommand::Get { key, max_age_ms } => {
      let max_age = max_age_ms.map(Duration::milliseconds);
      let value = cache.get_entry::<Value>(&key, max_age).await.map(|entry| {
        json!({ "value": entry.value, "cached_at": entry.cached_at.to_rfc3339() })
      });
      print_json(&value)
    }
    CacheCommand::Set { key, value } => {
      let value: Value =
        serde_json::from_str(&value).map_err(|e| eyre!("Failed to parse value as JSON: {}", e))?;
      print_json(&json!({ "stored": cache.set(&key, &value).await }))
    }
    CacheCommand::Del { key } => print_json(&json!({ "deleted": cache.delete(&key).await })),
  }
}

async fn run_pets(app: &app::App, command: PetsCommand) -> Result<()> {
  match command {
    PetsCommand::Age { birth_date } => {
      let age = model::age_from_str(&birth_date, Local::now().date_naive())
        .ok_or_else(|| eyre!("Invalid birth date: {}", birth_date))?;
      print_json(&json!({ "birth_date": birth_date, "age": age }))
    }
    PetsCommand::List { refresh } => {
      app.sign_in().await?;
      let pets = app.pets.fetch_family_pets(refresh).await;
      print_json(&json!({ "source": app.pets.snapshot().source, "pets": pets }))
    }
    PetsCommand::Show { id, refresh } => {
      app.sign_in().await?;
      let pet = app.pets.get_pet_by_id(&id, refresh).await;
      print_json(&pet)
    }
  }
}

async fn run_family(app: &app::App, command: FamilyCommand) -> Result<()> {
  app.sign_in().await?;
  match command {
    FamilyCommand::Show { refresh } => {
      if refresh {
        app.family.load_user_family(true).await;
      }
      print_json(&app.family.snapshot().family)
    }
    FamilyCommand::Create { name } => print_json(&app.family.create_family(&name).await?),
    FamilyCommand::Join { family_id } => print_json(&app.family.join_family(&family_id).await?),
    FamilyCommand::Leave => print_json(&json!({ "left": app.family.leave_family().await })),
  }
}

fn describe(outcome: &FetchOutcome) -> Value {
  match outcome {
    FetchOutcome::Passthrough => json!({ "route": null }),
    FetchOutcome::Handled { route, served } => json!({
      "route": route,
      "from": format!("{:?}", served.from),
      "status": served.response.status,
      "bytes": served.response.body.len(),
    }),
  }
}

async fn run_sw(worker: &ServiceWorker, command: SwCommand) -> Result<()> {
  match command {
    SwCommand::Install => print_json(&json!({ "precached": worker.install().await? })),
    SwCommand::Activate => print_json(&json!({ "removed": worker.activate().await? })),
    SwCommand::Fetch { url, request } => {
      let outcome = worker.fetch(&request.build(&url)?).await?;
      print_json(&describe(&outcome))
    }
    SwCommand::Route { urls, request } => {
      let mut routes = Vec::new();
      for url in &urls {
        let route = worker.router().route_for(&request.build(url)?);
        routes.push(json!({
          "url": url,
          "route": route.map(|r| r.name),
          "strategy": route.map(|r| r.strategy.name()),
          "partition": route.and_then(|r| r.strategy.partition()).map(|p| p.name.clone()),
        }));
      }
      print_json(&routes)
    }
    SwCommand::Push { payload } => print_json(&worker.push(Some(payload.as_bytes())).await?),
    SwCommand::Sync { tag } => {
      worker.sync(&tag).await?;
      print_json(&json!({ "synced": tag }))
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config)?;

  match args.command {
    Command::Cache(command) => run_cache(&app, command).await,
    Command::Pets(command) => run_pets(&app, command).await,
    Command::Family(command) => run_family(&app, command).await,
    Command::Sw(command) => run_sw(&app.service_worker()?, command).await,
  }
}
