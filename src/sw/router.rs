//! Routes intercepted requests to caching strategies.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::network::Network;
use super::partitions::{Expiration, ResponseCache};
use super::request::{Destination, Request};
use super::strategy::{PartitionSpec, Served, Strategy, StrategyContext};
use crate::config::PwaConfig;

pub const FIRESTORE_HOST: &str = "firestore.googleapis.com";
pub const STORAGE_HOST: &str = "firebasestorage.googleapis.com";

/// Which requests a route applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
  /// Any request to this host
  Host(String),
  /// Same-origin script, style, and worker requests
  SameOriginAssets,
  Destination(Destination),
  /// Document navigations, except paths on the deny list
  Navigation(DenyList),
}

/// Navigations the app shell must not answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyList {
  /// Path of the worker script itself
  pub service_worker_script: String,
}

impl DenyList {
  pub fn denies(&self, url: &Url) -> bool {
    let path = url.path();
    if path == self.service_worker_script {
      return true;
    }
    let file = path.rsplit('/').next().unwrap_or(path);
    file.starts_with("workbox-") && file.ends_with(".js")
  }
}

impl Matcher {
  fn matches(&self, request: &Request, origin: &Url) -> bool {
    match self {
      Matcher::Host(host) => request.url.host_str() == Some(host.as_str()),
      Matcher::SameOriginAssets => {
        request.is_same_origin(origin)
          && matches!(
            request.destination,
            Destination::Script | Destination::Style | Destination::Worker
          )
      }
      Matcher::Destination(destination) => request.destination == *destination,
      Matcher::Navigation(deny) => request.is_navigation() && !deny.denies(&request.url),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub name: &'static str,
  pub matcher: Matcher,
  pub strategy: Strategy,
}

/// Result of intercepting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// No route applies; the host performs the request itself
  Passthrough,
  Handled { route: &'static str, served: Served },
}

/// Partition names derived from the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  /// Precached app shell, written only on install
  pub shell: String,
  /// Pages visited by navigation
  pub pages: String,
  pub assets: String,
  pub images: String,
  pub fonts: String,
}

impl PartitionNames {
  pub fn new(prefix: &str) -> Self {
    Self {
      shell: format!("{}-shell-v1", prefix),
      pages: format!("{}-pages-v1", prefix),
      assets: format!("{}-assets-v1", prefix),
      images: format!("{}-images-v1", prefix),
      fonts: format!("{}-fonts-v1", prefix),
    }
  }

  pub fn all(&self) -> Vec<String> {
    vec![
      self.shell.clone(),
      self.pages.clone(),
      self.assets.clone(),
      self.images.clone(),
      self.fonts.clone(),
    ]
  }
}

/// First-match router over an ordered route table.
pub struct Router {
  origin: Url,
  routes: Vec<Route>,
  ctx: StrategyContext,
}

impl Router {
  pub fn new(origin: Url, routes: Vec<Route>, network: Arc<dyn Network>, cache: Arc<ResponseCache>) -> Self {
    Self {
      origin,
      routes,
      ctx: StrategyContext { network, cache },
    }
  }

  /// The route table of the app, highest priority first.
  pub fn default_routes(config: &PwaConfig) -> Result<Vec<Route>> {
    let origin = config.origin()?;
    let names = PartitionNames::new(&config.cache_prefix);

    let mut routes = vec![
      Route {
        name: "firestore",
        matcher: Matcher::Host(FIRESTORE_HOST.to_string()),
        strategy: Strategy::NetworkOnly,
      },
      Route {
        name: "storage",
        matcher: Matcher::Host(STORAGE_HOST.to_string()),
        strategy: Strategy::NetworkOnly,
      },
      Route {
        name: "assets",
        matcher: Matcher::SameOriginAssets,
        strategy: Strategy::StaleWhileRevalidate(PartitionSpec::new(
          names.assets,
          Expiration::new(60, Duration::days(7)),
        )),
      },
      Route {
        name: "images",
        matcher: Matcher::Destination(Destination::Image),
        strategy: Strategy::CacheFirst(PartitionSpec::new(
          names.images,
          Expiration::new(200, Duration::days(30)),
        )),
      },
      Route {
        name: "fonts",
        matcher: Matcher::Destination(Destination::Font),
        strategy: Strategy::CacheFirst(PartitionSpec::new(
          names.fonts,
          Expiration::new(30, Duration::days(365)),
        )),
      },
    ];

    // Server-rendered dev builds answer navigations themselves
    if !config.ssr || config.production {
      let fallback_url = origin
        .join(&config.fallback_html)
        .map_err(|e| eyre!("Invalid fallback document {}: {}", config.fallback_html, e))?;
      routes.push(Route {
        name: "navigation",
        matcher: Matcher::Navigation(DenyList {
          service_worker_script: config.service_worker_script.clone(),
        }),
        strategy: Strategy::NavigationFallback {
          pages: PartitionSpec::new(names.pages, Expiration::new(50, Duration::days(1))),
          shell: names.shell,
          fallback_url: fallback_url.to_string(),
        },
      });
    }

    Ok(routes)
  }

  /// The first route matching `request`.
  pub fn route_for(&self, request: &Request) -> Option<&Route> {
    if !request.is_http() || !request.is_get() {
      return None;
    }
    self
      .routes
      .iter()
      .find(|route| route.matcher.matches(request, &self.origin))
  }

  /// Intercept a request.
  pub async fn handle(&self, request: &Request) -> Result<FetchOutcome> {
    let Some(route) = self.route_for(request) else {
      debug!("No route for {}", request.url);
      return Ok(FetchOutcome::Passthrough);
    };

    debug!(
      "{} matched route {} ({})",
      request.url,
      route.name,
      route.strategy.name()
    );
    let served = route.strategy.handle(&self.ctx, request).await?;
    Ok(FetchOutcome::Handled {
      route: route.name,
      served,
    })
  }

  pub fn routes(&self) -> &[Route] {
    &self.routes
  }
}
