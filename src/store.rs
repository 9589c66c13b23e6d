//! Almacén clave-valor para el estado del frontend que sobrevive entre visitas
//! (historial del asistente, tema, análisis recientes).

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AppConfig, StoreBackend};

pub const CHAT_HISTORY_KEY: &str = "chat_history";
pub const THEME_KEY: &str = "theme";
pub const RECENT_ANALYSES_KEY: &str = "recent_analyses";

/// Callback de `KeyValueStore::update`: recibe el valor actual y devuelve el nuevo.
pub type UpdateFn<'a> = dyn FnMut(Option<&str>) -> Result<String> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Lectura-modificación-escritura de una clave bajo el mismo lock; ninguna
    /// otra escritura puede intercalarse. Si `apply` falla no se escribe nada.
    fn update(&self, key: &str, apply: &mut UpdateFn<'_>) -> Result<()>;
}

/// Implementación en memoria; también sirve como fake en los tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| anyhow!("Store en memoria envenenado"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("Store en memoria envenenado"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("Store en memoria envenenado"))?;
        entries.remove(key);
        Ok(())
    }

    fn update(&self, key: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("Store en memoria envenenado"))?;
        let next = apply(entries.get(key).map(String::as_str))?;
        entries.insert(key.to_string(), next);
        Ok(())
    }
}

/// Un único fichero JSON que se reescribe completo en cada mutación.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("No se pudo leer el store {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Store corrupto en {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };
        info!("Store abierto en {} ({} claves)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Aplica el cambio sobre una copia y sólo la adopta si llega a disco:
    /// la memoria nunca sirve valores que no se hayan guardado.
    fn mutate(&self, apply: impl FnOnce(&mut BTreeMap<String, String>) -> Result<()>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Store de fichero envenenado"))?;
        let mut next = entries.clone();
        apply(&mut next)?;
        persist(&self.path, &next)?;
        *entries = next;
        Ok(())
    }
}

fn persist(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("No se pudo crear {}", parent.display()))?;
    }
    // Escritura atómica: fichero temporal + rename.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(entries)?)
        .with_context(|| format!("No se pudo escribir {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("No se pudo reemplazar {}", path.display()))?;
    debug!("Store persistido en {}", path.display());
    Ok(())
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Store de fichero envenenado"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.remove(key);
            Ok(())
        })
    }

    fn update(&self, key: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        self.mutate(|entries| {
            let next = apply(entries.get(key).map(String::as_str))?;
            entries.insert(key.to_string(), next);
            Ok(())
        })
    }
}

/// Abre el backend configurado.
pub fn open_store(cfg: &AppConfig) -> Result<Arc<dyn KeyValueStore>> {
    match cfg.store_backend {
        StoreBackend::Memory => {
            info!("Usando store en memoria (no persiste entre reinicios).");
            Ok(Arc::new(MemoryStore::default()))
        }
        StoreBackend::File => Ok(Arc::new(FileStore::open(&cfg.store_path)?)),
    }
}

pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Valor corrupto en la clave '{key}'"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    store.set(key, &serde_json::to_string(value)?)
}

/// Versión tipada de `KeyValueStore::update`. Una clave ausente parte de
/// `T::default()`. Devuelve el valor tal y como quedó guardado.
pub fn update_json<T, F>(store: &dyn KeyValueStore, key: &str, modify: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T),
{
    let mut modify = Some(modify);
    let mut stored = None;
    store.update(key, &mut |current: Option<&str>| -> Result<String> {
        let mut value: T = match current {
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("Valor corrupto en la clave '{key}'"))?,
            None => T::default(),
        };
        if let Some(modify) = modify.take() {
            modify(&mut value);
        }
        let raw = serde_json::to_string(&value)?;
        stored = Some(value);
        Ok(raw)
    })?;
    stored.ok_or_else(|| anyhow!("El store no aplicó la actualización de '{key}'"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

pub fn load_theme(store: &dyn KeyValueStore) -> Result<Theme> {
    Ok(load_json(store, THEME_KEY)?.unwrap_or_default())
}

pub fn save_theme(store: &dyn KeyValueStore, theme: Theme) -> Result<()> {
    save_json(store, THEME_KEY, &theme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("missing").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        store.remove("never-set").unwrap();
    }

    #[test]
    fn memory_store_get_set_remove() {
        exercise(&MemoryStore::default());
    }

    #[test]
    fn file_store_get_set_remove() {
        let dir = tempdir().unwrap();
        exercise(&FileStore::open(dir.path().join("store.json")).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set(THEME_KEY, "\"dark\"").unwrap();
        }
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(load_theme(&reopened).unwrap(), Theme::Dark);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();
        let err = FileStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("Store corrupto"));
    }

    #[test]
    fn failed_persist_keeps_the_previous_value() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("data");
        let store = FileStore::open(parent.join("store.json")).unwrap();
        store.set("a", "1").unwrap();

        // Un fichero donde debería estar el directorio hace fallar la escritura.
        fs::remove_dir_all(&parent).unwrap();
        fs::write(&parent, "not a directory").unwrap();

        assert!(store.set("a", "2").is_err());
        assert!(store.update("a", &mut |_: Option<&str>| Ok("3".to_string())).is_err());
        assert!(store.remove("a").is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn update_json_starts_from_default_and_returns_the_stored_value() {
        let store = MemoryStore::default();
        let list: Vec<u32> = update_json(&store, "list", |v: &mut Vec<u32>| v.push(1)).unwrap();
        assert_eq!(list, vec![1]);
        let list: Vec<u32> = update_json(&store, "list", |v: &mut Vec<u32>| v.push(2)).unwrap();
        assert_eq!(list, vec![1, 2]);
        assert_eq!(store.get("list").unwrap().as_deref(), Some("[1,2]"));

        store.set("list", "oops").unwrap();
        assert!(update_json(&store, "list", |v: &mut Vec<u32>| v.push(3)).is_err());
        assert_eq!(store.get("list").unwrap().as_deref(), Some("oops"));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let dir = tempdir().unwrap();
        let stores: [Arc<dyn KeyValueStore>; 2] = [
            Arc::new(MemoryStore::default()),
            Arc::new(FileStore::open(dir.path().join("store.json")).unwrap()),
        ];
        for store in stores {
            std::thread::scope(|scope| {
                for worker in 0..8u32 {
                    let store = store.as_ref();
                    scope.spawn(move || {
                        for round in 0..25u32 {
                            update_json(store, "counter", |v: &mut Vec<u32>| v.push(worker * 100 + round))
                                .unwrap();
                        }
                    });
                }
            });
            let all: Vec<u32> = load_json(store.as_ref(), "counter").unwrap().unwrap();
            assert_eq!(all.len(), 8 * 25);
        }
    }

    #[test]
    fn theme_defaults_to_system() {
        let store = MemoryStore::default();
        assert_eq!(load_theme(&store).unwrap(), Theme::System);
        save_theme(&store, Theme::Light).unwrap();
        assert_eq!(store.get(THEME_KEY).unwrap().as_deref(), Some("\"light\""));
        assert_eq!(load_theme(&store).unwrap(), Theme::Light);
    }

    #[test]
    fn corrupt_values_are_errors_not_defaults() {
        let store = MemoryStore::default();
        store.set(THEME_KEY, "purple").unwrap();
        assert!(load_theme(&store).is_err());
    }
}
