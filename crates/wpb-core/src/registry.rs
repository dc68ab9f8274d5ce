//! Per-phone bot state: configuration toggles and the anti-delete cache.
//!
//! Entries are created lazily on the first registered connection and removed
//! as a unit on logout, so a config never outlives its cache (or vice versa).

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    anti_delete::MessageCache,
    domain::PhoneKey,
    store::{MemoryStore, StateStore},
};

pub const DEFAULT_REACT_EMOJI: &str = "❤️";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BotConfig {
    pub auto_view: bool,
    pub auto_react: bool,
    pub anti_delete: bool,
    pub react_emoji: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            auto_view: false,
            auto_react: false,
            anti_delete: true,
            react_emoji: DEFAULT_REACT_EMOJI.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct BotSession {
    pub config: BotConfig,
    pub cache: MessageCache,
}

pub type SharedBotSession = Arc<Mutex<BotSession>>;

/// Settings applied to newly created sessions.
#[derive(Clone, Debug)]
pub struct SessionDefaults {
    pub config: BotConfig,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            config: BotConfig::default(),
            cache_ttl: crate::anti_delete::DEFAULT_TTL,
            cache_max_entries: crate::anti_delete::DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn StateStore<PhoneKey, SharedBotSession>>,
    defaults: SessionDefaults,
    // Makes get-or-create atomic across concurrent flows.
    create: Arc<StdMutex<()>>,
}

impl SessionRegistry {
    pub fn new(defaults: SessionDefaults) -> Self {
        Self::with_store(defaults, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        defaults: SessionDefaults,
        store: Arc<dyn StateStore<PhoneKey, SharedBotSession>>,
    ) -> Self {
        Self {
            store,
            defaults,
            create: Arc::new(StdMutex::new(())),
        }
    }

    pub fn get(&self, phone: &PhoneKey) -> Option<SharedBotSession> {
        self.store.get(phone)
    }

    pub fn get_or_create(&self, phone: &PhoneKey) -> SharedBotSession {
        let _guard = self.create.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = self.store.get(phone) {
            return existing;
        }
        let session = Arc::new(Mutex::new(BotSession {
            config: self.defaults.config.clone(),
            cache: MessageCache::new(self.defaults.cache_ttl, self.defaults.cache_max_entries),
        }));
        self.store.set(phone.clone(), session.clone());
        session
    }

    /// Drop config and cache together. Returns whether an entry existed.
    pub fn remove(&self, phone: &PhoneKey) -> bool {
        self.store.delete(phone).is_some()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
