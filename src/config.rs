use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Shell assets precached on install.
pub const STATIC_ASSETS: &[&str] = &[
  "/",
  "/index.html",
  "/css/app.css",
  "/js/app.js",
  "/icons/favicon-16x16.png",
  "/icons/favicon-32x32.png",
  "/icons/favicon-96x96.png",
];

const ONE_DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub firebase: FirebaseConfig,
  #[serde(default)]
  pub user: UserConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub pwa: PwaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirebaseConfig {
  pub project_id: String,
  /// Firestore database id
  #[serde(default = "default_database")]
  pub database: String,
}

fn default_database() -> String {
  "(default)".to_string()
}

impl FirebaseConfig {
  /// Get the Firebase ID token from the environment.
  ///
  /// Checks MEOWLOG_ID_TOKEN. Without a token requests are unauthenticated.
  pub fn get_id_token() -> Option<String> {
    std::env::var("MEOWLOG_ID_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserConfig {
  /// The signed-in user; pets and family need one
  pub uid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Override for the cache database location
  pub path: Option<PathBuf>,
  pub pets_max_age_ms: i64,
  pub family_max_age_ms: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      pets_max_age_ms: ONE_DAY_MS,
      family_max_age_ms: ONE_DAY_MS,
    }
  }
}

impl CacheConfig {
  pub fn pets_max_age(&self) -> Duration {
    Duration::milliseconds(self.pets_max_age_ms)
  }

  pub fn family_max_age(&self) -> Duration {
    Duration::milliseconds(self.family_max_age_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PwaConfig {
  /// Origin the app is served from
  pub origin: String,
  /// Document served for navigations when offline
  pub fallback_html: String,
  pub service_worker_script: String,
  /// Server-side rendered build
  pub ssr: bool,
  pub production: bool,
  /// Prefix of every partition name this app owns
  pub cache_prefix: String,
  /// Paths fetched on install
  pub precache: Vec<String>,
}

impl Default for PwaConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:9000".to_string(),
      fallback_html: "/index.html".to_string(),
      service_worker_script: "/sw.js".to_string(),
      ssr: false,
      production: false,
      cache_prefix: "meow-log-cache".to_string(),
      precache: STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
    }
  }
}

impl PwaConfig {
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./meowlog.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/meowlog/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/meowlog/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("meowlog.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("meowlog").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.pwa.origin()?;
    Ok(config)
  }

  /// The signed-in user, required by pet and family commands.
  pub fn require_uid(&self) -> Result<&str> {
    self
      .user
      .uid
      .as_deref()
      .ok_or_else(|| eyre!("No user configured. Set user.uid in the config file."))
  }
}
