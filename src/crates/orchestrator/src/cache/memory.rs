//! In-process cache backed by `dashmap` and tokio broadcast channels

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CacheError, CacheResult, CacheStore};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Cache for single-process deployments and tests
///
/// [`InMemoryCache::set_available`] simulates an unreachable cache: every
/// operation fails with [`CacheError::Unavailable`] until it is switched back.
pub struct InMemoryCache {
    entries: DashMap<String, Entry>,
    lists: DashMap<String, VecDeque<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
    available: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            lists: DashMap::new(),
            channels: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("in-memory cache switched off".to_string()))
        }
    }

    fn entry(value: String, ttl: Option<Duration>) -> Entry {
        Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.ensure_available()?;
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        self.ensure_available()?;
        self.entries.insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Duration) -> CacheResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(Self::entry(value, Some(ttl)));
                    Ok(true)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Self::entry(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.ensure_available()?;
        self.entries.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn push_bounded(&self, key: &str, value: String, max_len: usize) -> CacheResult<()> {
        self.ensure_available()?;
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        while list.len() > max_len {
            list.pop_front();
        }
        Ok(())
    }

    async fn range(&self, key: &str) -> CacheResult<Vec<String>> {
        self.ensure_available()?;
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: String) -> CacheResult<usize> {
        self.ensure_available()?;
        Ok(match self.channels.get(channel) {
            // No live receivers is not an error for pub/sub
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        })
    }

    fn subscribe(&self, channel: &str) -> CacheResult<broadcast::Receiver<String>> {
        self.ensure_available()?;
        let capacity = self.channel_capacity;
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(sender.subscribe())
    }

    async fn close_channel(&self, channel: &str) -> CacheResult<()> {
        self.ensure_available()?;
        self.channels.remove(channel);
        Ok(())
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        self.ensure_available()?;
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
