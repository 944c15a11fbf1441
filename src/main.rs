mod cache;
mod config;
mod db;
mod event;
mod net;
mod queue;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::cache::{Served, StoreKind};
use crate::event::{ClientMessage, EventHandler, FetchEvent, HostEvent, WorkerEvent};
use crate::net::{Destination, HttpNetwork, Request};
use crate::worker::{ClickOutcome, Outcome, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "offline-sw")]
#[command(about = "Offline caching and request queueing worker for the blacklist web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin of the app, overriding the config file
  #[arg(short, long)]
  origin: Option<Url>,

  /// Also write logs to a daily file in the data directory
  #[arg(long)]
  log_file: bool,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Precache the app shell and activate this cache version
  Install,
  /// Purge stores of older cache versions
  Activate,
  /// Send a request through the worker
  Fetch {
    /// Path or absolute URL
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request header as "Name: value"; repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Kind of resource requested (document, image, font, script, style)
    #[arg(long, value_parser = parse_destination)]
    destination: Option<Destination>,
    /// Shorthand for --destination image
    #[arg(long, conflicts_with = "destination")]
    image: bool,
  },
  /// Replay queued requests now
  Sync,
  /// Refresh the periodically updated API data
  Refresh,
  /// Show a notification from a push payload
  Push {
    /// JSON payload with optional title, body, icon and url
    payload: Option<String>,
    /// Click the notification, optionally with an action ("open" or "close")
    #[arg(long, num_args = 0..=1, default_missing_value = "open")]
    click: Option<String>,
  },
  /// Post a message to the worker (CLEAR_CACHE, syncPosts)
  Message { message: String },
  /// List queued requests
  Queue,
  /// List cache stores and their entries
  Caches {
    /// Drop the cached GET of this path or URL from every current store
    #[arg(long)]
    evict: Option<String>,
  },
  /// Run periodic refresh and replay queued requests when connectivity returns
  Watch {
    /// Seconds between connectivity checks
    #[arg(long, default_value_t = 30)]
    poll_secs: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_file)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let db = Arc::new(db::Database::open(&config.database_path()?)?);
  let network = Arc::new(HttpNetwork::new()?);
  let sw = ServiceWorker::new(Arc::new(config), db, network);

  if !matches!(args.command, Cmd::Install | Cmd::Activate) && !sw.resume()? {
    warn!("No installed worker for this cache version; run `offline-sw install` first");
  }

  let result = run(&sw, args.command).await;
  sw.settle().await;
  result
}

fn init_logging(log_file: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file_layer, guard) = if log_file {
    let dir = config::data_dir()?;
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create log directory: {}", e))?;
    let appender = tracing_appender::rolling::daily(&dir, "offline-sw.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    (
      Some(fmt::layer().with_ansi(false).with_writer(writer)),
      Some(guard),
    )
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

async fn run(sw: &ServiceWorker, command: Cmd) -> Result<()> {
  match command {
    Cmd::Install => print_outcome(sw.dispatch(WorkerEvent::Install).await?),
    Cmd::Activate => print_outcome(sw.dispatch(WorkerEvent::Activate).await?),
    Cmd::Fetch {
      url,
      method,
      headers,
      data,
      navigate,
      destination,
      image,
    } => {
      let destination = if image { Some(Destination::Image) } else { destination };
      let request = build_request(sw, &url, &method, &headers, data, navigate, destination)?;
      print_served(&sw.fetch(FetchEvent::new(request)).await);
    }
    Cmd::Sync => {
      let tag = sw.config().sync.queue_tag.clone();
      print_outcome(sw.dispatch(WorkerEvent::Sync { tag }).await?);
    }
    Cmd::Refresh => {
      let tag = sw.config().sync.periodic_tag.clone();
      print_outcome(sw.dispatch(WorkerEvent::PeriodicSync { tag }).await?);
    }
    Cmd::Push { payload, click } => {
      let payload = payload.map(String::into_bytes);
      let outcome = sw.dispatch(WorkerEvent::Push { payload }).await?;
      let notification_id = match &outcome {
        Outcome::Notified(notification) => Some(notification.id),
        _ => None,
      };
      print_outcome(outcome);

      if let (Some(notification_id), Some(action)) = (notification_id, click) {
        let event = WorkerEvent::NotificationClick {
          notification_id,
          action: Some(action),
        };
        print_outcome(sw.dispatch(event).await?);
      }
    }
    Cmd::Message { message } => {
      let message = ClientMessage::parse(&message);
      print_outcome(sw.dispatch(WorkerEvent::Message(message)).await?);
    }
    Cmd::Queue => {
      let entries = sw.queue().entries()?;
      if entries.is_empty() {
        println!("Queue is empty");
      }
      for entry in entries {
        println!(
          "#{} {} {} (queued {})",
          entry.id,
          entry.method,
          entry.url,
          entry.enqueued_at.to_rfc3339()
        );
      }
    }
    Cmd::Caches { evict: Some(target) } => {
      let request = Request::get(sw.config().resolve(&target)?);
      let mut evicted = 0;
      for kind in StoreKind::ALL {
        if sw.cache().delete(kind, &request)? {
          println!("Evicted {} from {}", request.url, sw.cache().name(kind));
          evicted += 1;
        }
      }
      if evicted == 0 {
        println!("{} is not cached", request.url);
      }
    }
    Cmd::Caches { evict: None } => {
      println!("Worker: {:?}", sw.state());
      let current = sw.config().current_store_names();
      for name in sw.cache().store_names()? {
        let marker = if current.contains(&name) { "" } else { " (obsolete)" };
        println!("{}{}", name, marker);
      }
      for kind in StoreKind::ALL {
        for key in sw.cache().keys(kind)? {
          println!("  {} {}", sw.cache().name(kind), key);
        }
      }
    }
    Cmd::Watch { poll_secs } => watch(sw, Duration::from_secs(poll_secs)).await?,
  }
  Ok(())
}

fn build_request(
  sw: &ServiceWorker,
  url: &str,
  method: &str,
  headers: &[String],
  data: Option<String>,
  navigate: bool,
  destination: Option<Destination>,
) -> Result<Request> {
  let url = sw.config().resolve(url)?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::new(method.clone(), url)
  };
  request.method = method;
  if let Some(destination) = destination {
    request = request.with_destination(destination);
  }
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(data) = data {
    request = request.with_body(data);
  }
  Ok(request)
}

fn parse_destination(s: &str) -> Result<Destination, String> {
  s.parse()
}

/// Poll connectivity on every tick. Replays the queue when the origin comes
/// back, and refreshes API data once per sync interval while online.
async fn watch(sw: &ServiceWorker, poll: Duration) -> Result<()> {
  let mut events = EventHandler::new(poll);
  let refresh_every = Duration::from_secs(sw.config().sync.interval_secs);
  let mut last_refresh: Option<Instant> = None;
  let mut online = sw.check_online().await;
  info!(online, "Watching for connectivity changes");

  while let Some(event) = events.next().await {
    match event {
      HostEvent::Tick => {
        let now_online = sw.check_online().await;
        if now_online && !online {
          info!("Connectivity restored");
          let tag = sw.config().sync.queue_tag.clone();
          match sw.dispatch(WorkerEvent::Sync { tag }).await {
            Ok(outcome) => print_outcome(outcome),
            Err(e) => warn!("Sync failed: {}", e),
          }
        } else if !now_online && online {
          info!("Connectivity lost");
        }
        online = now_online;

        let due = last_refresh.map_or(true, |at| at.elapsed() >= refresh_every);
        if online && due {
          let tag = sw.config().sync.periodic_tag.clone();
          match sw.dispatch(WorkerEvent::PeriodicSync { tag }).await {
            Ok(outcome) => print_outcome(outcome),
            Err(e) => warn!("Periodic sync failed: {}", e),
          }
          last_refresh = Some(Instant::now());
        }
      }
      HostEvent::Shutdown => {
        info!("Shutting down");
        break;
      }
    }
  }

  Ok(())
}

fn print_served(served: &Served) {
  let response = &served.response;
  println!("{} {} [{:?}]", response.status, response.status_text, served.source);
  for (name, value) in &response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", response.text());
}

fn print_outcome(outcome: Outcome) {
  match outcome {
    Outcome::Installed { precached, purged } => {
      println!("Installed: {} URLs precached", precached);
      for name in purged {
        println!("Deleted obsolete store {}", name);
      }
    }
    Outcome::Activated { purged } => {
      println!("Activated");
      for name in purged {
        println!("Deleted obsolete store {}", name);
      }
    }
    Outcome::Served(served) => print_served(&served),
    Outcome::Replayed(report) => println!(
      "Replayed {}, expired {}, retained {}",
      report.replayed, report.expired, report.retained
    ),
    Outcome::Refreshed(count) => println!("Refreshed {} URLs", count),
    Outcome::Notified(notification) => {
      match serde_json::to_string_pretty(&notification) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to render notification: {}", e),
      }
    }
    Outcome::Clicked(ClickOutcome::Focused(client)) => {
      println!("Focused window #{} {}", client.id, client.url)
    }
    Outcome::Clicked(ClickOutcome::Opened(client)) => {
      println!("Opened window #{} {}", client.id, client.url)
    }
    Outcome::Clicked(ClickOutcome::Dismissed) => println!("Dismissed"),
    Outcome::Cleared(count) => println!("Cleared {} stores", count),
    Outcome::Ignored => println!("Ignored"),
  }
}
