//! Per-job config file
//!
//! Batch schedulers write the job's limits to a root-owned file so users
//! cannot raise them by editing their environment. Format is one
//! `KEY=value` per line; lines starting with `#` and blank lines are ignored.
//! When a key is present here it wins over the environment.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use softmig_core::env::env_get_str;
use tracing::debug;

use super::defaults;

#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl JobConfig {
    /// Path of this job's config file, if running inside a job
    ///
    /// `<dir>/<job>_<array>.conf` for array tasks, `<dir>/<job>.conf`
    /// otherwise. `<dir>` is `SOFTMIG_CONFIG_DIR` or `/var/run/softmig`.
    pub fn path_from_env() -> Option<PathBuf> {
        let job = std::env::var("SLURM_JOB_ID").ok().filter(|j| !j.is_empty())?;
        let dir = PathBuf::from(env_get_str("SOFTMIG_CONFIG_DIR", defaults::JOB_CONFIG_DIR));
        let name = match std::env::var("SLURM_ARRAY_TASK_ID") {
            Ok(array) if !array.is_empty() => format!("{}_{}.conf", job, array),
            _ => format!("{}.conf", job),
        };
        Some(dir.join(name))
    }

    /// Load this job's config file; `None` outside a job or if absent
    pub fn from_env() -> Option<Self> {
        let path = Self::path_from_env()?;
        match Self::load(&path) {
            Ok(cfg) => {
                debug!(path = %path.display(), keys = cfg.values.len(), "loaded job config");
                Some(cfg)
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no job config");
                None
            }
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(path.to_path_buf(), &text))
    }

    fn parse(path: PathBuf, text: &str) -> Self {
        let values = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        JobConfig { path, values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file (job teardown)
    pub fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}
