use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::similarity::DEFAULT_THRESHOLD;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cfg {
    pub ledger_path: PathBuf,
    pub image_dir: PathBuf,
    pub similarity_threshold: f32,
    pub bind: String,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("data/chain.json"),
            image_dir: PathBuf::from("data/images"),
            similarity_threshold: DEFAULT_THRESHOLD,
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl Cfg {
    /// Load from a YAML file when given, defaults otherwise; env vars win
    /// over both.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg: Cfg = match path {
            Some(p) => {
                let txt = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file: {}", p.display()))?;
                serde_yaml::from_str(&txt).context("failed to parse config YAML")?
            }
            None => Cfg::default(),
        };

        if let Ok(v) = std::env::var("IMGCHAIN_LEDGER") {
            cfg.ledger_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("IMGCHAIN_IMAGE_DIR") {
            cfg.image_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("IMGCHAIN_THRESHOLD") {
            match v.parse() {
                Ok(t) => cfg.similarity_threshold = t,
                Err(_) => tracing::warn!(
                    "ignoring unparseable IMGCHAIN_THRESHOLD {v:?}, keeping {}",
                    cfg.similarity_threshold
                ),
            }
        }
        if let Ok(v) = std::env::var("IMGCHAIN_BIND") {
            cfg.bind = v;
        }
        Ok(cfg)
    }
}
