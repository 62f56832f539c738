//! Process-wide runtime bootstrap and the model catalog.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    backend::{Context, DimOverride, OptLevel},
    errors::{Result, SegError},
    provider::Provider,
    traits::ModelLoader,
};

const RUNTIME_NAME: &str = "sam-seg";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_MODEL_FILE: &str = "model.onnx";
const USER_MODEL_SUBDIR: &str = "sam-seg/models";

static RUNTIME: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialise the runtime once per process.
///
/// Repeated calls return the outcome of the first one. A failure is sticky: every
/// dependent call reports it instead of retrying.
pub fn runtime() -> Result<()> {
    RUNTIME
        .get_or_init(|| {
            let committed = ort::init().with_name(RUNTIME_NAME).commit();
            match committed {
                Ok(_) => {
                    debug!("onnx runtime initialised");
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "onnx runtime unavailable");
                    Err(e.to_string())
                }
            }
        })
        .clone()
        .map_err(|message| SegError::Model {
            operation: "runtime initialisation".to_string(),
            source: message.into(),
        })
}

/// Catalog entry read from a model directory's `config.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub task_type: String,
    pub backend: String,
    pub num_inputs: usize,
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_task")]
    task: String,
    #[serde(default = "default_backend")]
    backend: String,
    #[serde(default = "default_num_inputs")]
    num_inputs: usize,
}

fn default_task() -> String {
    "general".to_string()
}

fn default_backend() -> String {
    "onnx".to_string()
}

const fn default_num_inputs() -> usize {
    1
}

fn read_model_config(dir: &Path) -> Result<Option<ModelInfo>> {
    let path = dir.join(CONFIG_FILE);
    let text = fs::read_to_string(&path).map_err(|e| SegError::FileSystem {
        path: path.clone(),
        operation: "read model config".to_string(),
        source: e,
    })?;
    let cfg: ModelConfig = serde_json::from_str(&text).map_err(|e| SegError::Catalog {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let (Some(id), Some(name)) = (cfg.id, cfg.name) else {
        return Ok(None);
    };
    Ok(Some(ModelInfo {
        id,
        name,
        description: cfg.description,
        task_type: cfg.task,
        backend: cfg.backend,
        num_inputs: cfg.num_inputs,
        dir: dir.to_path_buf(),
    }))
}

/// Scan each immediate subdirectory of `root` that carries a `config.json`.
fn scan_directory(root: &Path, catalog: &mut Vec<ModelInfo>) {
    if !root.is_dir() {
        return;
    }
    let dirs = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_dir() && e.path().join(CONFIG_FILE).is_file());

    for entry in dirs {
        match read_model_config(entry.path()) {
            Ok(Some(info)) => {
                if catalog.iter().any(|m| m.id == info.id) {
                    debug!(id = %info.id, dir = %entry.path().display(), "skipping duplicate model id");
                    continue;
                }
                debug!(id = %info.id, name = %info.name, backend = %info.backend, "discovered model");
                catalog.push(info);
            }
            Ok(None) => {
                debug!(dir = %entry.path().display(), "model config lacks id or name");
            }
            Err(e) => warn!(error = %e, "skipping model directory"),
        }
    }
}

/// Per-user model directory, scanned after the explicit search paths.
pub fn user_model_dir() -> Option<PathBuf> {
    let base = if cfg!(target_os = "windows") {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    };
    base.map(|b| b.join(USER_MODEL_SUBDIR))
}

/// Runtime handle plus model catalog and default provider preference.
///
/// Shared behind an `Arc`; contexts it loads are independent of it once created.
#[derive(Debug)]
pub struct Environment {
    search_paths: Vec<PathBuf>,
    user_dir: Option<PathBuf>,
    catalog: RwLock<Vec<ModelInfo>>,
    provider: Mutex<Provider>,
}

impl Environment {
    /// Initialise from `;`-separated search paths plus the per-user model directory.
    pub fn init(search_paths: Option<&str>) -> Result<Arc<Self>> {
        Self::with_options(search_paths, user_model_dir(), Provider::Auto)
    }

    pub fn with_options(
        search_paths: Option<&str>,
        user_dir: Option<PathBuf>,
        provider: Provider,
    ) -> Result<Arc<Self>> {
        runtime()?;
        let search_paths = search_paths
            .map(|s| {
                s.split(';')
                    .filter(|p| !p.trim().is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let env = Self {
            search_paths,
            user_dir,
            catalog: RwLock::new(Vec::new()),
            provider: Mutex::new(provider),
        };
        env.refresh();
        info!(
            models = env.model_count(),
            provider = %provider,
            "environment initialised"
        );
        Ok(Arc::new(env))
    }

    /// Rescan every search path, replacing the catalog.
    pub fn refresh(&self) {
        let mut fresh = Vec::new();
        for path in self.search_paths.iter().chain(self.user_dir.iter()) {
            scan_directory(path, &mut fresh);
        }
        debug!(models = fresh.len(), "model catalog refreshed");
        *self.catalog.write() = fresh;
    }

    pub fn model_count(&self) -> usize {
        self.catalog.read().len()
    }

    pub fn model_info_by_index(&self, index: usize) -> Option<ModelInfo> {
        self.catalog.read().get(index).cloned()
    }

    pub fn model_info_by_id(&self, id: &str) -> Option<ModelInfo> {
        self.catalog.read().iter().find(|m| m.id == id).cloned()
    }

    pub fn models_for_task(&self, task: &str) -> Vec<ModelInfo> {
        self.catalog
            .read()
            .iter()
            .filter(|m| m.task_type == task)
            .cloned()
            .collect()
    }

    pub fn model_dir(&self, id: &str) -> Option<PathBuf> {
        self.model_info_by_id(id).map(|m| m.dir)
    }

    pub fn provider(&self) -> Provider {
        *self.provider.lock()
    }

    /// Provider used when a load asks for `Auto`.
    pub fn set_provider(&self, provider: Provider) {
        *self.provider.lock() = provider;
    }

    /// Load `file` (default `model.onnx`) of catalog model `id`.
    pub fn load(&self, id: &str, file: Option<&str>, provider: Provider) -> Result<Context> {
        self.load_ext(id, file, provider, OptLevel::All, &[])
    }

    pub fn load_ext(
        &self,
        id: &str,
        file: Option<&str>,
        provider: Provider,
        opt: OptLevel,
        overrides: &[DimOverride],
    ) -> Result<Context> {
        let provider = match provider {
            Provider::Auto => self.provider(),
            p => p,
        };
        let info = self.model_info_by_id(id).ok_or_else(|| {
            debug!(id, "model id not in catalog");
            SegError::ModelNotFound { id: id.to_string() }
        })?;
        if info.backend != "onnx" {
            return Err(SegError::UnknownBackend {
                id: id.to_string(),
                backend: info.backend,
            });
        }
        let path = info.dir.join(file.unwrap_or(DEFAULT_MODEL_FILE));
        Context::load_from_path(&path, provider, opt, overrides)
    }
}

impl ModelLoader for Environment {
    type Session = Context;

    fn load_session(
        &self,
        model_id: &str,
        file: &str,
        provider: Provider,
        opt: OptLevel,
        overrides: &[DimOverride],
    ) -> Result<Context> {
        self.load_ext(model_id, Some(file), provider, opt, overrides)
    }

    fn provider(&self) -> Provider {
        Environment::provider(self)
    }

    fn set_provider(&self, provider: Provider) {
        Environment::set_provider(self, provider);
    }
}
