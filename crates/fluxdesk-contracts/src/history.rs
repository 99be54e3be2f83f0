use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoStore;
use crate::errors::JobError;
use crate::events::now_utc_iso;
use crate::request::GenerationParams;

pub const HISTORY_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub prompt: String,
    pub params: GenerationParams,
    pub timestamp: String,
}

impl PromptRecord {
    pub fn new(prompt: &str, params: GenerationParams) -> Self {
        Self {
            prompt: prompt.to_string(),
            params,
            timestamp: now_utc_iso(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: String,
    #[serde(flatten)]
    pub record: PromptRecord,
}

/// Decrypted shape of `history.enc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStore {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    #[serde(default)]
    pub prompts: Vec<PromptRecord>,
    /// Keyed by prompt text, so a prompt is favorited at most once.
    #[serde(default)]
    pub favorites: IndexMap<String, PromptRecord>,
    #[serde(default)]
    pub templates: Vec<TemplateRecord>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self {
            schema_version: HISTORY_SCHEMA_VERSION,
            prompts: Vec::new(),
            favorites: IndexMap::new(),
            templates: Vec::new(),
        }
    }
}

fn default_schema_version() -> u64 {
    HISTORY_SCHEMA_VERSION
}

/// Encrypted prompt history, favorites and templates.
///
/// Every mutation runs load, mutate and persist under one lock and rewrites
/// the whole file. History is advisory: an unreadable file loads as an empty
/// store instead of failing.
#[derive(Debug)]
pub struct HistoryRepository {
    path: PathBuf,
    crypto: Arc<CryptoStore>,
    state: Mutex<HistoryStore>,
}

impl HistoryRepository {
    pub fn open(path: impl Into<PathBuf>, crypto: Arc<CryptoStore>) -> Self {
        let path = path.into();
        let state = load_store(&path, &crypto);
        Self {
            path,
            crypto,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh read of the backing file; never fails.
    pub fn load(&self) -> HistoryStore {
        load_store(&self.path, &self.crypto)
    }

    pub fn snapshot(&self) -> HistoryStore {
        self.lock().clone()
    }

    pub fn add_prompt(&self, prompt: &str, params: GenerationParams) -> Result<(), JobError> {
        self.mutate(|store| {
            store.prompts.push(PromptRecord::new(prompt, params));
            true
        })
    }

    /// No-op when the prompt text is already a favorite.
    pub fn add_favorite(&self, prompt: &str, params: GenerationParams) -> Result<bool, JobError> {
        self.mutate_with(|store| {
            if store.favorites.contains_key(prompt) {
                return false;
            }
            store
                .favorites
                .insert(prompt.to_string(), PromptRecord::new(prompt, params));
            true
        })
    }

    pub fn remove_favorite(&self, prompt: &str) -> Result<bool, JobError> {
        self.mutate_with(|store| store.favorites.shift_remove(prompt).is_some())
    }

    /// Re-using a template name replaces that template in place.
    pub fn add_template(
        &self,
        name: &str,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<(), JobError> {
        let template = TemplateRecord {
            name: name.trim().to_string(),
            record: PromptRecord::new(prompt, params),
        };
        self.mutate(|store| {
            match store
                .templates
                .iter_mut()
                .find(|existing| existing.name == template.name)
            {
                Some(existing) => *existing = template,
                None => store.templates.push(template),
            }
            true
        })
    }

    pub fn remove_template(&self, name: &str) -> Result<bool, JobError> {
        self.mutate_with(|store| {
            let before = store.templates.len();
            store.templates.retain(|template| template.name != name);
            store.templates.len() != before
        })
    }

    /// The last `limit` prompts, oldest of the window first.
    pub fn recent_prompts(&self, limit: usize) -> Vec<PromptRecord> {
        let state = self.lock();
        let start = state.prompts.len().saturating_sub(limit);
        state.prompts[start..].to_vec()
    }

    pub fn favorites(&self) -> Vec<PromptRecord> {
        self.lock().favorites.values().cloned().collect()
    }

    pub fn templates(&self) -> Vec<TemplateRecord> {
        self.lock().templates.clone()
    }

    pub fn history_len(&self) -> usize {
        self.lock().prompts.len()
    }

    /// Out-of-range indices are ignored and nothing is written.
    pub fn remove_prompt(&self, index: usize) -> Result<bool, JobError> {
        self.mutate_with(|store| {
            if index >= store.prompts.len() {
                return false;
            }
            store.prompts.remove(index);
            true
        })
    }

    pub fn clear_prompts(&self) -> Result<(), JobError> {
        self.mutate(|store| {
            store.prompts.clear();
            true
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut HistoryStore) -> bool) -> Result<(), JobError> {
        self.mutate_with(apply).map(|_| ())
    }

    fn mutate_with(&self, apply: impl FnOnce(&mut HistoryStore) -> bool) -> Result<bool, JobError> {
        let mut state = self.lock();
        let mut working = match read_store(&self.path, &self.crypto) {
            Ok(Some(on_disk)) => on_disk,
            Ok(None) => HistoryStore::default(),
            // Unreadable file: keep what this process already knows.
            Err(_) => state.clone(),
        };
        let changed = apply(&mut working);
        if changed {
            write_store(&self.path, &self.crypto, &working)?;
        }
        *state = working;
        Ok(changed)
    }

    fn lock(&self) -> MutexGuard<'_, HistoryStore> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decrypt-or-initialize-empty.
pub fn load_store(path: &Path, crypto: &CryptoStore) -> HistoryStore {
    match read_store(path, crypto) {
        Ok(Some(store)) => store,
        Ok(None) => HistoryStore::default(),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "history unreadable; starting with an empty store"
            );
            HistoryStore::default()
        }
    }
}

fn read_store(path: &Path, crypto: &CryptoStore) -> Result<Option<HistoryStore>, JobError> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(JobError::io_at("read", path, err)),
    };
    let plaintext = crypto.decrypt(&blob)?;
    serde_json::from_slice::<HistoryStore>(&plaintext)
        .map(Some)
        .map_err(|err| JobError::Decrypt(format!("history payload is not valid JSON: {err}")))
}

fn write_store(path: &Path, crypto: &CryptoStore, store: &HistoryStore) -> Result<(), JobError> {
    let payload = serde_json::to_vec(store)
        .map_err(|err| JobError::Configuration(format!("history serialization failed: {err}")))?;
    let blob = crypto.encrypt(&payload)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| JobError::io_at("create", parent, err))?;
    }
    let staging = path.with_extension("enc.tmp");
    fs::write(&staging, blob).map_err(|err| JobError::io_at("write", &staging, err))?;
    fs::rename(&staging, path).map_err(|err| JobError::io_at("replace", path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::crypto::EncryptionKey;
    use crate::request::{AspectRatio, Quality};

    use super::*;

    fn repo(dir: &Path) -> anyhow::Result<HistoryRepository> {
        let crypto = Arc::new(CryptoStore::open(
            dir.join("history.key"),
            &dir.join("history.enc"),
        )?);
        Ok(HistoryRepository::open(dir.join("history.enc"), crypto))
    }

    fn params() -> GenerationParams {
        GenerationParams {
            aspect_ratio: AspectRatio::Wide16x9,
            quality: Quality::High,
        }
    }

    #[test]
    fn missing_file_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        assert_eq!(repo.load(), HistoryStore::default());
        assert!(repo.recent_prompts(10).is_empty());
        Ok(())
    }

    #[test]
    fn corrupted_file_loads_empty_instead_of_failing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        repo.add_prompt("a red cube", params())?;

        let path = temp.path().join("history.enc");
        let mut blob = fs::read(&path)?;
        let mid = blob.len() / 2;
        blob[mid] ^= 0xff;
        fs::write(&path, blob)?;

        assert_eq!(repo.load(), HistoryStore::default());
        let reopened = HistoryRepository::open(&path, Arc::new(CryptoStore::open(
            temp.path().join("history.key"),
            &path,
        )?));
        assert_eq!(reopened.history_len(), 0);
        Ok(())
    }

    #[test]
    fn lost_key_leaves_existing_history_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        repo(temp.path())?.add_prompt("a red cube", params())?;
        let path = temp.path().join("history.enc");
        let before = fs::read(&path)?;
        fs::remove_file(temp.path().join("history.key"))?;

        let err = repo(temp.path()).unwrap_err();
        assert!(err.to_string().contains("encrypted data"));
        assert_eq!(fs::read(&path)?, before);
        assert!(!temp.path().join("history.key").exists());
        Ok(())
    }

    #[test]
    fn history_written_with_another_key_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        repo.add_prompt("a red cube", params())?;

        let stranger = Arc::new(CryptoStore::new(&EncryptionKey::generate()));
        let other = HistoryRepository::open(temp.path().join("history.enc"), stranger);
        assert_eq!(other.history_len(), 0);
        Ok(())
    }

    #[test]
    fn persisted_file_is_not_plaintext() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        repo.add_prompt("a very secret prompt", params())?;

        let raw = fs::read(temp.path().join("history.enc"))?;
        let needle = b"a very secret prompt";
        assert!(!raw.windows(needle.len()).any(|window| window == needle));
        Ok(())
    }

    #[test]
    fn prompts_survive_reopen_in_insertion_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        {
            let repo = repo(temp.path())?;
            for prompt in ["one", "two", "three", "four"] {
                repo.add_prompt(prompt, params())?;
            }
        }
        let repo = repo(temp.path())?;
        let recent: Vec<String> = repo
            .recent_prompts(3)
            .into_iter()
            .map(|record| record.prompt)
            .collect();
        assert_eq!(recent, vec!["two", "three", "four"]);
        assert_eq!(repo.recent_prompts(100).len(), 4);
        assert_eq!(repo.recent_prompts(0).len(), 0);
        assert_eq!(repo.recent_prompts(1)[0].params, params());
        Ok(())
    }

    #[test]
    fn favorites_are_deduplicated_by_prompt_text() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        assert!(repo.add_favorite("a red cube", params())?);
        assert!(!repo.add_favorite("a red cube", GenerationParams::default())?);
        assert_eq!(repo.favorites().len(), 1);
        assert_eq!(repo.favorites()[0].params, params());

        assert!(repo.remove_favorite("a red cube")?);
        assert!(repo.favorites().is_empty());
        Ok(())
    }

    #[test]
    fn templates_replace_by_name() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        repo.add_template("portrait", "a portrait", params())?;
        repo.add_template("landscape", "a valley", params())?;
        repo.add_template("portrait", "a better portrait", params())?;

        let templates = repo.templates();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].name, "portrait");
        assert_eq!(templates[0].record.prompt, "a better portrait");

        assert!(repo.remove_template("landscape")?);
        assert!(!repo.remove_template("landscape")?);
        assert_eq!(repo.templates().len(), 1);
        Ok(())
    }

    #[test]
    fn remove_prompt_out_of_range_is_a_silent_noop() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = repo(temp.path())?;
        repo.add_prompt("one", params())?;
        repo.add_prompt("two", params())?;

        assert!(!repo.remove_prompt(7)?);
        assert_eq!(repo.history_len(), 2);

        assert!(repo.remove_prompt(0)?);
        assert_eq!(repo.recent_prompts(10)[0].prompt, "two");

        repo.clear_prompts()?;
        assert_eq!(repo.history_len(), 0);
        assert_eq!(repo.load().prompts.len(), 0);
        Ok(())
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let repo = Arc::new(repo(temp.path())?);

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let repo = Arc::clone(&repo);
                scope.spawn(move || {
                    for idx in 0..5 {
                        repo.add_prompt(&format!("prompt {worker}-{idx}"), params())
                            .expect("history write");
                    }
                });
            }
            let repo = Arc::clone(&repo);
            scope.spawn(move || {
                repo.add_favorite("manual favorite", params())
                    .expect("favorite write");
            });
        });

        let on_disk = repo.load();
        assert_eq!(on_disk.prompts.len(), 20);
        assert_eq!(on_disk.favorites.len(), 1);
        Ok(())
    }

    #[test]
    fn separate_instances_merge_through_the_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let a = repo(temp.path())?;
        let b = repo(temp.path())?;

        a.add_prompt("from a", params())?;
        b.add_favorite("from b", params())?;

        let merged = a.load();
        assert_eq!(merged.prompts.len(), 1);
        assert_eq!(merged.favorites.len(), 1);
        Ok(())
    }
}
