use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::security::identity;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WindowState {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub maximised: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "zh-Hans")]
    Chinese,
}

impl Default for Language {
    fn default() -> Self {
        Language::English
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ConfigData {
    window_state: WindowState,
    id: String,
    private_key: String,
    public_key: String,
    save_path: PathBuf,
    host_name: String,
    auto_accept: bool,
    save_history: bool,
    /// peer id -> accepted public key
    trusted_peer: HashMap<String, String>,
    language: Language,
    close_to_systray: bool,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            window_state: WindowState::default(),
            id: String::new(),
            private_key: String::new(),
            public_key: String::new(),
            save_path: PathBuf::new(),
            host_name: String::new(),
            auto_accept: false,
            save_history: true,
            trusted_peer: HashMap::new(),
            language: Language::default(),
            close_to_systray: false,
        }
    }
}

/// Durable settings shared by every service. Setters take the write lock,
/// mutate in memory and rewrite the file atomically; getters clone under the
/// read lock.
#[derive(Debug)]
pub struct ConfigStore {
    dir: PathBuf,
    path: PathBuf,
    data: RwLock<ConfigData>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mesh-drop")
}

pub fn default_save_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("Downloads")
}

impl ConfigStore {
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_dir())
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to prepare config directory {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);

        let mut data = if path.exists() {
            Self::read_data(&path).unwrap_or_else(|err| {
                log::error!("failed to load config, falling back to defaults: {err:#}");
                ConfigData::default()
            })
        } else {
            log::info!("config file not found, creating {}", path.display());
            ConfigData::default()
        };

        if data.id.is_empty() {
            data.id = Uuid::new_v4().to_string();
        }
        if data.host_name.is_empty() {
            data.host_name = hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string());
        }
        if data.save_path.as_os_str().is_empty() {
            data.save_path = default_save_path();
        }
        if data.private_key.is_empty() || data.public_key.is_empty() {
            let (private, public) = identity::generate_key();
            data.private_key = private;
            data.public_key = public;
        }
        if let Err(err) = fs::create_dir_all(&data.save_path) {
            log::error!(
                "failed to create save path {}: {err}",
                data.save_path.display()
            );
        }

        let store = Self {
            dir: dir.to_path_buf(),
            path,
            data: RwLock::new(data),
        };
        if let Ok(guard) = store.data.read() {
            if let Err(err) = store.persist(&guard) {
                log::error!("failed to save config: {err:#}");
            }
        }
        Ok(store)
    }

    fn read_data(path: &Path) -> Result<ConfigData> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents).context("invalid config payload")
    }

    /// Temp-file write plus rename so a crash mid-save never truncates the
    /// previous config.
    fn persist(&self, data: &ConfigData) -> Result<()> {
        let payload = serde_json::to_vec_pretty(data).context("failed to serialise config")?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(&payload)
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, mutate: impl FnOnce(&mut ConfigData)) {
        let Ok(mut guard) = self.data.write() else {
            log::error!("config store poisoned, dropping update");
            return;
        };
        mutate(&mut guard);
        if let Err(err) = self.persist(&guard) {
            log::error!("failed to save config: {err:#}");
        }
    }

    fn read<T>(&self, get: impl FnOnce(&ConfigData) -> T) -> T
    where
        T: Default,
    {
        self.data.read().map(|guard| get(&guard)).unwrap_or_default()
    }

    pub fn config_dir(&self) -> &Path {
        &self.dir
    }

    pub fn id(&self) -> String {
        self.read(|data| data.id.clone())
    }

    pub fn private_key(&self) -> String {
        self.read(|data| data.private_key.clone())
    }

    pub fn public_key(&self) -> String {
        self.read(|data| data.public_key.clone())
    }

    pub fn host_name(&self) -> String {
        self.read(|data| data.host_name.clone())
    }

    pub fn set_host_name(&self, host_name: impl Into<String>) {
        let host_name = host_name.into();
        self.update(|data| data.host_name = host_name);
    }

    pub fn save_path(&self) -> PathBuf {
        self.read(|data| data.save_path.clone())
    }

    pub fn set_save_path(&self, save_path: impl Into<PathBuf>) {
        let save_path = save_path.into();
        self.update(|data| {
            if let Err(err) = fs::create_dir_all(&save_path) {
                log::error!("failed to create save path {}: {err}", save_path.display());
            }
            data.save_path = save_path;
        });
    }

    pub fn auto_accept(&self) -> bool {
        self.read(|data| data.auto_accept)
    }

    pub fn set_auto_accept(&self, auto_accept: bool) {
        self.update(|data| data.auto_accept = auto_accept);
    }

    pub fn save_history(&self) -> bool {
        self.read(|data| data.save_history)
    }

    pub fn set_save_history(&self, save_history: bool) {
        self.update(|data| data.save_history = save_history);
    }

    pub fn window_state(&self) -> WindowState {
        self.read(|data| data.window_state)
    }

    pub fn set_window_state(&self, state: WindowState) {
        self.update(|data| data.window_state = state);
    }

    pub fn language(&self) -> Language {
        self.read(|data| data.language)
    }

    pub fn set_language(&self, language: Language) {
        self.update(|data| data.language = language);
    }

    pub fn close_to_systray(&self) -> bool {
        self.read(|data| data.close_to_systray)
    }

    pub fn set_close_to_systray(&self, close_to_systray: bool) {
        self.update(|data| data.close_to_systray = close_to_systray);
    }

    pub fn add_trust(&self, peer_id: impl Into<String>, public_key: impl Into<String>) {
        let (peer_id, public_key) = (peer_id.into(), public_key.into());
        self.update(|data| {
            data.trusted_peer.insert(peer_id, public_key);
        });
    }

    pub fn remove_trust(&self, peer_id: &str) {
        self.update(|data| {
            data.trusted_peer.remove(peer_id);
        });
    }

    pub fn trusted(&self) -> HashMap<String, String> {
        self.read(|data| data.trusted_peer.clone())
    }

    pub fn trusted_key(&self, peer_id: &str) -> Option<String> {
        self.read(|data| data.trusted_peer.get(peer_id).cloned())
    }

    pub fn is_trusted(&self, peer_id: &str) -> bool {
        self.read(|data| data.trusted_peer.contains_key(peer_id))
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
