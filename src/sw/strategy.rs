//! Caching strategies a route can dispatch to.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::network::Network;
use super::partitions::{Expiration, ResponseCache};
use super::request::{Request, Response};

/// A partition and its eviction policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
  pub name: String,
  pub expiration: Expiration,
}

impl PartitionSpec {
  pub fn new(name: impl Into<String>, expiration: Expiration) -> Self {
    Self {
      name: name.into(),
      expiration,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
  /// Always go to the network, never touch a cache
  NetworkOnly,
  /// Serve from cache; on a miss fetch and populate
  CacheFirst(PartitionSpec),
  /// Serve from cache when present and refresh it in the background; on a
  /// miss fetch and populate
  StaleWhileRevalidate(PartitionSpec),
  /// Network, then the cached copy of this URL, then the app shell document.
  /// Visited pages go to the bounded `pages` partition; the shell document is
  /// read from the precache partition `shell` and never written here.
  NavigationFallback {
    pages: PartitionSpec,
    shell: String,
    fallback_url: String,
  },
}

impl Strategy {
  pub fn name(&self) -> &'static str {
    match self {
      Strategy::NetworkOnly => "network-only",
      Strategy::CacheFirst(_) => "cache-first",
      Strategy::StaleWhileRevalidate(_) => "stale-while-revalidate",
      Strategy::NavigationFallback { .. } => "navigation-fallback",
    }
  }

  /// The partition this strategy reads and writes, if any.
  pub fn partition(&self) -> Option<&PartitionSpec> {
    match self {
      Strategy::NetworkOnly => None,
      Strategy::CacheFirst(p) | Strategy::StaleWhileRevalidate(p) => Some(p),
      Strategy::NavigationFallback { pages, .. } => Some(pages),
    }
  }
}

/// Where a handled response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  Cache,
  Network,
  /// Fetched from the network and written to the partition
  NetworkThenCache,
  /// The precached app shell stood in for a failed navigation
  Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
  pub response: Response,
  pub from: ServedFrom,
}

/// What strategies need to do their work.
#[derive(Clone)]
pub struct StrategyContext {
  pub network: Arc<dyn Network>,
  pub cache: Arc<ResponseCache>,
}

impl StrategyContext {
  /// Fetch and store when the response is a plain 200.
  async fn fetch_and_cache(&self, partition: &PartitionSpec, request: &Request) -> Result<Served> {
    let response = self.network.fetch(request).await?;
    let from = if store_if_cacheable(&self.cache, partition, request.url.as_str(), &response).await {
      ServedFrom::NetworkThenCache
    } else {
      ServedFrom::Network
    };
    Ok(Served { response, from })
  }

  /// A cache lookup whose errors count as a miss.
  async fn lookup(&self, partition: &PartitionSpec, url: &str) -> Option<Response> {
    self
      .cache
      .match_url(&partition.name, url, &partition.expiration)
      .await
      .unwrap_or_else(|e| {
        warn!("Cache lookup in {} failed: {}", partition.name, e);
        None
      })
  }
}

/// Write `response` unless it is partial or an error. Returns whether it was stored.
async fn store_if_cacheable(cache: &ResponseCache, partition: &PartitionSpec, url: &str, response: &Response) -> bool {
  if !response.is_cacheable() {
    debug!("Not caching {} ({})", url, response.status);
    return false;
  }
  match cache.put(&partition.name, url, response, &partition.expiration).await {
    Ok(()) => true,
    Err(e) => {
      warn!("Failed to cache {} in {}: {}", url, partition.name, e);
      false
    }
  }
}

impl Strategy {
  pub async fn handle(&self, ctx: &StrategyContext, request: &Request) -> Result<Served> {
    match self {
      Strategy::NetworkOnly => Ok(Served {
        response: ctx.network.fetch(request).await?,
        from: ServedFrom::Network,
      }),

      Strategy::CacheFirst(partition) => {
        if let Some(response) = ctx.lookup(partition, request.url.as_str()).await {
          return Ok(Served {
            response,
            from: ServedFrom::Cache,
          });
        }
        ctx.fetch_and_cache(partition, request).await
      }

      Strategy::StaleWhileRevalidate(partition) => {
        let Some(response) = ctx.lookup(partition, request.url.as_str()).await else {
          return ctx.fetch_and_cache(partition, request).await;
        };

        // Detached refresh: the caller already has the cached copy
        let refresh_ctx = ctx.clone();
        let partition = partition.clone();
        let request = request.clone();
        tokio::spawn(async move {
          match refresh_ctx.network.fetch(&request).await {
            Ok(fresh) => {
              store_if_cacheable(&refresh_ctx.cache, &partition, request.url.as_str(), &fresh).await;
            }
            Err(e) => debug!("Revalidation of {} failed: {}", request.url, e),
          }
        });

        Ok(Served {
          response,
          from: ServedFrom::Cache,
        })
      }

      Strategy::NavigationFallback {
        pages,
        shell,
        fallback_url,
      } => {
        let network_error = match ctx.fetch_and_cache(pages, request).await {
          Ok(served) => return Ok(served),
          Err(e) => e,
        };
        debug!("Navigation to {} failed: {}", request.url, network_error);

        if let Some(response) = ctx.lookup(pages, request.url.as_str()).await {
          return Ok(Served {
            response,
            from: ServedFrom::Cache,
          });
        }
        let precache = PartitionSpec::new(shell.as_str(), Expiration::default());
        if let Some(response) = ctx.lookup(&precache, fallback_url).await {
          return Ok(Served {
            response,
            from: ServedFrom::Fallback,
          });
        }
        Err(eyre!(
          "Navigation to {} failed and no fallback is cached: {}",
          request.url,
          network_error
        ))
      }
    }
  }
}
