/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::services::Service;
use crate::subscription_manager::SubscriptionId;

/// Key/value store with per-key expiry, used to persist subscriptions and the last known remote epoch
/// across restarts. Expired entries must never be returned.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn has(&self, key: &str) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value`; with `ttl` of `None` the entry never expires
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// All non-expired keys starting with `prefix`, in ascending order
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    /// All non-expired entries whose key starts with `prefix`, in ascending key order
    async fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

pub(crate) const SUBSCRIPTION_KEY_PREFIX: &str = "sub:";
pub(crate) const SUBSCRIPTION_ID_COUNTER_KEY: &str = "counter:abo-id";

/// How long an observed remote epoch is remembered
pub(crate) const EPOCH_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub(crate) fn subscription_key(service: Service, id: SubscriptionId) -> String {
    format!("{SUBSCRIPTION_KEY_PREFIX}{service}:{id}")
}

pub(crate) fn start_dienst_zst_key(service: Service) -> String {
    format!("epoch:{service}:start-dienst-zst")
}

pub(crate) fn daten_version_id_key(service: Service) -> String {
    format!("epoch:{service}:daten-version-id")
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// `Storage` backed by a map in memory; entries are evicted lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left until `key` expires; `None` if it does not exist or never expires
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(now))
    }

    fn live_entries(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.is_live(now));
        entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .live_entries(prefix)
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    async fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self.live_entries(prefix))
    }
}
