use std::{
    env, fs,
    path::{Path, PathBuf},
};

use nestdb_engine::DatabaseConfig;
use serde::{Deserialize, Serialize};

/// Replication role settings. A configured primary URL makes this node a
/// secondary: it tails the primary and forwards writes to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub primary: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: DatabaseConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl Config {
    /// Load config from TOML file, with environment variable overrides.
    /// Falls back to defaults if the file is not found; NESTDB_CONFIG
    /// overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        ConfigLoader::new().load(path)
    }
}

/// Resolves configuration from file, CLI args, and environment variables.
struct ConfigLoader {
    args: Vec<String>,
}

impl ConfigLoader {
    fn new() -> Self {
        Self {
            args: env::args().collect(),
        }
    }

    fn load<P: AsRef<Path>>(&self, default_path: P) -> anyhow::Result<Config> {
        let mut cfg_path = self.resolve_config_path(default_path);

        // Allow NESTDB_CONFIG to fully override any arg/default
        if let Ok(env_path) = env::var("NESTDB_CONFIG") {
            cfg_path = PathBuf::from(env_path);
        }

        match fs::read_to_string(&cfg_path) {
            Ok(s) => {
                let mut cfg: Config = toml::from_str(&s)?;
                Self::apply_env_overrides(&mut cfg);
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut cfg = Config::default();
                Self::apply_env_overrides(&mut cfg);
                Ok(cfg)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve config path from CLI args or the default.
    fn resolve_config_path<P: AsRef<Path>>(&self, default_path: P) -> PathBuf {
        if let Some(p) = Self::find_config_arg(&self.args) {
            p
        } else {
            default_path.as_ref().to_path_buf()
        }
    }

    /// Find --config or -c flag in arguments.
    fn find_config_arg(args: &[String]) -> Option<PathBuf> {
        let mut iter = args.iter().peekable();
        while let Some(a) = iter.next() {
            if a.starts_with("--config=") || a.starts_with("-c=") {
                if let Some((_, val)) = a.split_once('=') {
                    return Some(PathBuf::from(val));
                }
            } else if a == "--config" || a == "-c" {
                if let Some(next) = iter.peek() {
                    return Some(PathBuf::from((*next).clone()));
                }
            }
        }
        None
    }

    /// Apply NESTDB_* environment variable overrides.
    fn apply_env_overrides(cfg: &mut Config) {
        if let Ok(v) = env::var("NESTDB_DATA_DIR") {
            cfg.storage.dir = PathBuf::from(v);
        }

        if let Ok(v) = env::var("NESTDB_DRIVER") {
            cfg.storage.driver = v;
        }

        if let Ok(v) = env::var("NESTDB_PRIMARY") {
            if v.is_empty() {
                cfg.replication.primary = None;
            } else {
                cfg.replication.primary = Some(v);
            }
        }
    }
}
