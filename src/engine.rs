//! Engine facade: config → backend → components, plus the background tasks.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{self, Backend};
use crate::config::{expand_path, Config};
use crate::lookup::{
    parse_algorithms, Directory, HashDetails, HashIndexer, IndexStats, LookupResolver,
    StaticDirectory,
};
use crate::pepper::{self, PepperManager, PepperSchedule};
use crate::reaper;
use crate::scheduler::TaskHandle;
use crate::tokens::TokenStore;

pub struct Engine {
    backend: Arc<dyn Backend>,
    tokens: TokenStore,
    pepper: Arc<PepperManager>,
    resolver: LookupResolver,
    indexer: Option<Arc<HashIndexer>>,
    schedule: PepperSchedule,
    reaper_interval: Duration,
    tasks: Vec<TaskHandle>,
}

impl Engine {
    /// Connect the configured backend (schema included) and load the pepper.
    ///
    /// When `lookup.directory` is set, the JSON directory file is attached as
    /// the hash index source.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let backend = backend::connect(&config.database)
            .await
            .context("Failed to open storage backend")?;
        let tokens = TokenStore::new(Arc::clone(&backend), &config.tokens);
        let pepper = Arc::new(
            PepperManager::load(Arc::clone(&backend))
                .await
                .context("Failed to load lookup pepper")?,
        );
        let resolver = LookupResolver::new(Arc::clone(&backend), Arc::clone(&pepper), &config.lookup)?;
        let schedule = PepperSchedule::parse(&config.lookup.pepper_cron)?;

        let mut engine = Self {
            backend,
            tokens,
            pepper,
            resolver,
            indexer: None,
            schedule,
            reaper_interval: Duration::from_secs(config.tokens.vacuum_delay_secs),
            tasks: Vec::new(),
        };

        if let Some(raw) = &config.lookup.directory {
            let path = expand_path(raw)?;
            let directory = StaticDirectory::from_file(&path)?;
            tracing::info!(path = %path.display(), entries = directory.len(), "Directory loaded");
            engine.attach_directory(Arc::new(directory), &config.lookup.algorithms)?;
        }

        tracing::info!(backend = engine.backend.name(), "Engine ready");
        Ok(engine)
    }

    /// Use `directory` as the source for the hash index.
    pub fn attach_directory(
        &mut self,
        directory: Arc<dyn Directory>,
        algorithms: &[String],
    ) -> Result<()> {
        let algorithms = parse_algorithms(algorithms)?;
        self.indexer = Some(Arc::new(HashIndexer::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.pepper),
            directory,
            algorithms,
        )));
        Ok(())
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_pepper_schedule(mut self, schedule: PepperSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Spawn the reaper and the pepper rotation. Calling twice is a no-op.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        self.tasks
            .push(reaper::spawn(self.tokens.clone(), self.reaper_interval));
        self.tasks.push(pepper::spawn_rotation(
            Arc::clone(&self.pepper),
            self.schedule.clone(),
            self.indexer.clone(),
        ));
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| !t.is_finished())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn pepper(&self) -> &Arc<PepperManager> {
        &self.pepper
    }

    pub fn resolver(&self) -> &LookupResolver {
        &self.resolver
    }

    pub fn current_salt(&self) -> String {
        self.pepper.current_salt()
    }

    pub fn hash_details(&self) -> HashDetails {
        self.resolver.hash_details()
    }

    pub async fn resolve<S: AsRef<str>>(&self, hashes: &[S]) -> crate::Result<HashMap<String, String>> {
        self.resolver.resolve(hashes).await
    }

    /// Rebuild the hash index from the attached directory.
    pub async fn refresh_index(&self) -> Result<IndexStats> {
        let indexer = self
            .indexer
            .as_ref()
            .context("No directory configured (lookup.directory)")?;
        Ok(indexer.refresh().await?)
    }

    /// Stop background tasks, then release the backend.
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.stop().await;
        }
        self.backend.close().await;
        tracing::info!("Engine stopped");
    }
}
