use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::logging;

/// Durable relative-path -> remote object id store.
///
/// The whole map is kept in memory and rewritten on every mutation by
/// serializing to a sibling temp file and renaming over the canonical
/// path, so a crash mid-write leaves either the old or the new contents,
/// never a torn file. All access goes through one mutex: a single logical
/// writer even with many workers plus the reconciliation loop.
pub struct PathMappingStore {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    map: BTreeMap<String, String>,
}

impl PathMappingStore {
    pub fn load(path: &Path) -> Result<Self> {
        let map = match fs::read(path) {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, String>>(&data) {
                Ok(map) => map,
                Err(err) => {
                    logging::warn_kv(
                        "mapping store unreadable, starting empty",
                        &[("path", &path.display().to_string()), ("error", &err.to_string())],
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read mapping store {}", path.display()))
            }
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                map,
            }),
        })
    }

    pub fn get(&self, rel_path: &str) -> Option<String> {
        let inner = self.inner.lock().expect("mapping store lock");
        inner.map.get(rel_path).cloned()
    }

    /// Replace-if-present upsert; the previous object id for the path, if
    /// any, is fully superseded.
    pub fn upsert(&self, rel_path: &str, object_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("mapping store lock");
        inner
            .map
            .insert(rel_path.to_string(), object_id.to_string());
        inner.persist()
    }

    /// Removes the mapping, returning the object id it pointed at.
    pub fn remove(&self, rel_path: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().expect("mapping store lock");
        let old = inner.map.remove(rel_path);
        if old.is_some() {
            inner.persist()?;
        }
        Ok(old)
    }

    pub fn list_all(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().expect("mapping store lock");
        inner
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mapping store lock").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&self.map).context("encode mapping store")?;
        let tmp = self.temp_path();
        fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("rename {} -> {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "mappings.json".to_string());
        let unique = uuid::Uuid::new_v4().as_simple().to_string();
        self.path
            .with_file_name(format!(".{name}.tmp-{unique}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn upsert_get_remove_roundtrip() {
        let dir = make_temp_dir("kbsync-store-test");
        let path = dir.join("mappings.json");
        let store = PathMappingStore::load(&path).unwrap();

        store.upsert("notes.txt", "obj123").unwrap();
        assert_eq!(store.get("notes.txt").as_deref(), Some("obj123"));

        let old = store.remove("notes.txt").unwrap();
        assert_eq!(old.as_deref(), Some("obj123"));
        assert_eq!(store.get("notes.txt"), None);
        assert!(store.remove("notes.txt").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let dir = make_temp_dir("kbsync-store-replace-test");
        let store = PathMappingStore::load(&dir.join("mappings.json")).unwrap();

        store.upsert("a.txt", "obj-old").unwrap();
        store.upsert("a.txt", "obj-new").unwrap();
        assert_eq!(store.get("a.txt").as_deref(), Some("obj-new"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn mutations_survive_reload() {
        let dir = make_temp_dir("kbsync-store-reload-test");
        let path = dir.join("mappings.json");
        {
            let store = PathMappingStore::load(&path).unwrap();
            store.upsert("a.txt", "obj-a").unwrap();
            store.upsert("b.txt", "obj-b").unwrap();
        }
        let store = PathMappingStore::load(&path).unwrap();
        assert_eq!(
            store.list_all(),
            vec![
                ("a.txt".to_string(), "obj-a".to_string()),
                ("b.txt".to_string(), "obj-b".to_string()),
            ]
        );
    }

    #[test]
    fn corrupt_store_file_starts_empty() {
        let dir = make_temp_dir("kbsync-store-corrupt-test");
        let path = dir.join("mappings.json");
        fs::write(&path, b"{not json").unwrap();
        let store = PathMappingStore::load(&path).unwrap();
        assert!(store.is_empty());
        // A mutation rewrites a clean file.
        store.upsert("a.txt", "obj-a").unwrap();
        let reloaded = PathMappingStore::load(&path).unwrap();
        assert_eq!(reloaded.get("a.txt").as_deref(), Some("obj-a"));
    }

    #[test]
    fn interrupted_write_leaves_canonical_contents_intact() {
        let dir = make_temp_dir("kbsync-store-interrupted-test");
        let path = dir.join("mappings.json");
        let store = PathMappingStore::load(&path).unwrap();
        store.upsert("a.txt", "obj-a").unwrap();

        // A crash between writing the temp file and renaming it leaves a
        // stray temp sibling with arbitrary contents; it must not shadow
        // the canonical file on reload.
        fs::write(dir.join(".mappings.json.tmp-deadbeef"), b"{garbage").unwrap();

        let reloaded = PathMappingStore::load(&path).unwrap();
        assert_eq!(reloaded.get("a.txt").as_deref(), Some("obj-a"));
        reloaded.upsert("b.txt", "obj-b").unwrap();
        let again = PathMappingStore::load(&path).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again.get("b.txt").as_deref(), Some("obj-b"));
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = make_temp_dir("kbsync-store-tmp-test");
        let path = dir.join("mappings.json");
        let store = PathMappingStore::load(&path).unwrap();
        store.upsert("a.txt", "obj-a").unwrap();
        store.upsert("b.txt", "obj-b").unwrap();
        store.remove("a.txt").unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["mappings.json".to_string()]);
    }
}
