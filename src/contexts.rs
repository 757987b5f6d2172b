//! Context registry: named working-directory bindings.
//!
//! The default context maps to the home directory. Every directory under
//! the repos directory is a context of the same name, and custom bindings
//! stored in the database can point anywhere.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::DEFAULT_CONTEXT;
use crate::error::DatabaseError;
use crate::store::Database;

pub struct ContextRegistry {
    db: Arc<dyn Database>,
    home_dir: PathBuf,
    repos_dir: PathBuf,
}

impl ContextRegistry {
    pub fn new(db: Arc<dyn Database>, home_dir: PathBuf, repos_dir: PathBuf) -> Self {
        Self {
            db,
            home_dir,
            repos_dir,
        }
    }

    pub fn repos_dir(&self) -> &PathBuf {
        &self.repos_dir
    }

    /// Sorted names of the directories under the repos directory.
    async fn repo_dirs(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.repos_dir).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names
    }

    /// Default context, then repos, then custom bindings not already listed.
    pub async fn available(&self) -> Result<Vec<String>, DatabaseError> {
        let mut contexts = vec![DEFAULT_CONTEXT.to_string()];
        for name in self.repo_dirs().await {
            if name != DEFAULT_CONTEXT {
                contexts.push(name);
            }
        }
        for (name, _) in self.db.list_custom_contexts().await? {
            if !contexts.contains(&name) {
                contexts.push(name);
            }
        }
        Ok(contexts)
    }

    pub async fn custom(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        self.db.list_custom_contexts().await
    }

    /// Match `input` against the available contexts: exact
    /// (case-insensitive) first, then by prefix.
    pub async fn resolve_name(&self, input: &str) -> Result<Option<String>, DatabaseError> {
        let available = self.available().await?;
        Ok(fuzzy_match(&available, input).map(str::to_string))
    }

    /// Find a directory under the repos directory for `name`.
    pub async fn resolve_repo_path(&self, name: &str) -> Option<PathBuf> {
        let dirs = self.repo_dirs().await;
        fuzzy_match(&dirs, name).map(|d| self.repos_dir.join(d))
    }

    /// Working directory for `context`. Unknown contexts fall back to home.
    pub async fn working_dir(&self, context: &str) -> PathBuf {
        if context == DEFAULT_CONTEXT {
            return self.home_dir.clone();
        }

        match self.db.list_custom_contexts().await {
            Ok(custom) => {
                if let Some((_, path)) = custom.into_iter().find(|(name, _)| name == context) {
                    return PathBuf::from(path);
                }
            }
            Err(e) => tracing::warn!(context, "Failed to read custom contexts: {e}"),
        }

        let repo = self.repos_dir.join(context);
        if repo.is_dir() {
            return repo;
        }

        tracing::debug!(context, "Unknown context, using home directory");
        self.home_dir.clone()
    }

    /// The submitter's active context, defaulting to the home context.
    pub async fn active(&self, submitter: &str) -> String {
        match self.db.get_active_context(submitter).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => DEFAULT_CONTEXT.to_string(),
            Err(e) => {
                tracing::warn!(submitter, "Failed to read active context: {e}");
                DEFAULT_CONTEXT.to_string()
            }
        }
    }

    pub async fn set_active(&self, submitter: &str, context: &str) -> Result<(), DatabaseError> {
        self.db.set_active_context(submitter, context).await
    }

    pub async fn add_custom(&self, name: &str, path: &str) -> Result<(), DatabaseError> {
        self.db.add_custom_context(name, path).await
    }

    pub async fn remove_custom(&self, name: &str) -> Result<bool, DatabaseError> {
        self.db.remove_custom_context(name).await
    }
}

fn fuzzy_match<'a>(candidates: &'a [String], input: &str) -> Option<&'a str> {
    let needle = input.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|c| c.to_lowercase() == needle)
        .or_else(|| candidates.iter().find(|c| c.to_lowercase().starts_with(&needle)))
        .map(String::as_str)
}
