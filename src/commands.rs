//! Subcommand handlers for the `carelink` binary.

use carelink::api::HttpMethod;
use carelink::query::{CacheStrategy, ExecuteParams, FacadeConfig, RequestTarget};
use carelink::{ApiClient, ApiError, AuthToken};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// GET a resource through the cache
  Get {
    /// Path relative to the base URL, or an absolute URL
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    #[arg(long)]
    cache_key: Option<String>,
    /// cache-first, network-first, cache-only or network-only
    #[arg(short, long, default_value = "network-first")]
    strategy: CacheStrategy,
    /// TTL for the cached response, in seconds
    #[arg(long)]
    ttl: Option<u64>,
    /// Bypass cached values
    #[arg(short, long)]
    force: bool,
  },

  /// Send a request; queued when offline
  Send {
    method: HttpMethod,
    path: String,
    /// JSON body (query string for DELETE)
    #[arg(short, long)]
    data: Option<String>,
    #[arg(long)]
    cache_key: Option<String>,
  },

  /// Store credentials
  Login {
    #[arg(long)]
    access_token: String,
    #[arg(long)]
    refresh_token: Option<String>,
  },

  /// Clear stored credentials
  Logout,

  /// Refresh the access token now
  Refresh,

  /// Inspect or clear the response cache
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Inspect, clear or replay the offline queue
  #[command(subcommand)]
  Queue(QueueCommand),

  /// Show connectivity, auth and cache state
  Status,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  Keys,
  Clear,
  Remove { key: String },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  List,
  Clear,
  /// Replay queued requests now
  Flush,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn print_json(value: &Value) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn request_failed(err: ApiError) -> color_eyre::Report {
  match &err.details {
    Some(details) => eyre!("{} ({}): {}", err, err.kind, details),
    None => eyre!("{} ({})", err, err.kind),
  }
}

pub async fn run(command: Command, client: &ApiClient) -> Result<()> {
  match command {
    Command::Get {
      path,
      params,
      cache_key,
      strategy,
      ttl,
      force,
    } => {
      let mut target = RequestTarget::get(path);
      if !params.is_empty() {
        let query: Map<String, Value> = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        target = target.params(Value::Object(query));
      }
      if let Some(key) = cache_key {
        target = target.cache_key(key);
      }

      let mut config = FacadeConfig::<Value>::default()
        .strategy(strategy)
        .retries(client.config().api.retries)
        .retry_delay(client.config().retry_delay());
      if let Some(ttl) = ttl {
        config = config.ttl(Duration::from_secs(ttl));
      }

      let facade = client.query(target, config);
      let data = facade
        .execute(ExecuteParams::default().force_refresh(force))
        .await
        .map_err(request_failed)?;
      let info = facade.cache_info();
      info!(source = ?info.source, cached = info.is_cached, "request complete");
      print_json(&data)
    }

    Command::Send {
      method,
      path,
      data,
      cache_key,
    } => {
      let body = data
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| eyre!("Invalid JSON body: {}", e))?;
      let descriptor = client
        .descriptor(method, path)
        .maybe_params(body)
        .maybe_cache_key(cache_key);
      if !client.monitor().is_online() && !method.is_get() {
        eprintln!("Offline: request queued until connectivity returns (Ctrl-C leaves it queued)");
      }
      let response = client.request(descriptor).await.map_err(request_failed)?;
      print_json(&json!({"status": response.status, "data": response.data}))
    }

    Command::Login {
      access_token,
      refresh_token,
    } => {
      client
        .auth()
        .set_token(Some(AuthToken::new(access_token, refresh_token)));
      println!("Credentials stored");
      Ok(())
    }

    Command::Logout => {
      client.auth().logout();
      println!("Logged out");
      Ok(())
    }

    Command::Refresh => {
      let token = client.auth().refresh().await.map_err(request_failed)?;
      println!(
        "Token refreshed (refresh token {})",
        if token.refresh_token.is_some() { "present" } else { "absent" }
      );
      Ok(())
    }

    Command::Cache(CacheCommand::Keys) => {
      for key in client.cache().keys() {
        println!("{}", key);
      }
      Ok(())
    }

    Command::Cache(CacheCommand::Clear) => {
      client.cache().clear();
      println!("Cache cleared");
      Ok(())
    }

    Command::Cache(CacheCommand::Remove { key }) => {
      client.cache().remove(&key);
      println!("Removed {}", key);
      Ok(())
    }

    Command::Queue(QueueCommand::List) => {
      let pending = client.monitor().pending_requests();
      let value = serde_json::to_value(&pending).map_err(|e| eyre!("Failed to format queue: {}", e))?;
      print_json(&value)
    }

    Command::Queue(QueueCommand::Clear) => {
      let count = client.monitor().pending_requests().len();
      client.monitor().clear_pending_requests();
      println!("Discarded {} queued request(s)", count);
      Ok(())
    }

    Command::Queue(QueueCommand::Flush) => {
      if !client.monitor().is_online() {
        return Err(eyre!("Cannot flush the queue while offline"));
      }
      let report = client.monitor().drain_pending().await;
      println!(
        "Sent {}, requeued {}, dropped {}",
        report.sent, report.requeued, report.dropped
      );
      Ok(())
    }

    Command::Status => {
      let state = client.monitor().state();
      let stats = client.cache().stats();
      print_json(&json!({
        "baseUrl": client.config().api.base_url,
        "network": state,
        "online": state.is_online(),
        "authenticated": client.auth().is_authenticated(),
        "pendingRequests": client.monitor().pending_requests().len(),
        "cache": {"entries": stats.entries, "bytes": stats.bytes},
      }))
    }
  }
}
