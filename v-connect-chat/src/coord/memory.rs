use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CoordError, CoordResult, CoordinationStore};

/// 每多少次写入顺带做一次全量过期清理 / Full expiry sweep once per this many writes
const SWEEP_EVERY_WRITES: u64 = 1024;

enum Value {
    Str(String),
    Set(BTreeSet<String>),
    Counter(i64),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// 进程内协调存储（测试与单进程模式）；多个网关可共享同一实例模拟集群
/// In-process coordination store; several gateways may share one instance to simulate a fleet
pub struct MemoryCoordStore {
    entries: DashMap<String, Slot>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可达 / Toggle simulated outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> CoordResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordError::Unavailable("memory store offline".to_string()))
        }
    }

    // 惰性淘汰 / lazy eviction
    fn purge(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// 删除全部已过期键，返回删除数量 / Drop every expired key, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// 当前键数（含尚未清理的过期键）/ Key count, including expired keys not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // 写入路径上的摊销清理 / amortized sweep on the write path
    fn note_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_WRITES == SWEEP_EVERY_WRITES - 1 {
            self.purge_expired();
        }
    }

    fn wrong_type(key: &str) -> CoordError {
        CoordError::Protocol(format!("WRONGTYPE {}", key))
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<()> {
        self.check()?;
        self.note_write();
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> CoordResult<Option<String>> {
        self.check()?;
        self.purge(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(slot) => match &slot.value {
                Value::Str(s) => Ok(Some(s.clone())),
                Value::Counter(n) => Ok(Some(n.to_string())),
                Value::Set(_) => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn mget(&self, keys: &[String]) -> CoordResult<Vec<Option<String>>> {
        self.check()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.purge(key);
            out.push(self.entries.get(key).and_then(|slot| match &slot.value {
                Value::Str(s) => Some(s.clone()),
                Value::Counter(n) => Some(n.to_string()),
                Value::Set(_) => None,
            }));
        }
        Ok(out)
    }

    async fn del(&self, key: &str) -> CoordResult<()> {
        self.check()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool> {
        self.check()?;
        self.purge(key);
        match self.entries.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> CoordResult<()> {
        self.check()?;
        self.note_write();
        self.purge(key);
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> CoordResult<()> {
        self.check()?;
        self.purge(key);
        let now_empty = match self.entries.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                Value::Set(set) => {
                    set.remove(member);
                    set.is_empty()
                }
                _ => return Err(Self::wrong_type(key)),
            },
            None => false,
        };
        // 空集合即删除 / empty sets vanish
        if now_empty {
            self.entries
                .remove_if(key, |_, slot| matches!(&slot.value, Value::Set(s) if s.is_empty()));
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> CoordResult<Vec<String>> {
        self.check()?;
        self.purge(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(slot) => match &slot.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn incr_window(&self, key: &str, window: Duration) -> CoordResult<i64> {
        self.check()?;
        self.note_write();
        self.purge(key);
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Counter(0),
            expires_at: None,
        });
        let count = match &mut slot.value {
            Value::Counter(n) => {
                *n += 1;
                *n
            }
            _ => return Err(Self::wrong_type(key)),
        };
        if count == 1 {
            slot.expires_at = Some(Instant::now() + window);
        }
        Ok(count)
    }

    async fn ping(&self) -> CoordResult<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryCoordStore::new();
        store.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_window_sets_expiry_once() {
        let store = MemoryCoordStore::new();
        let window = Duration::from_millis(1000);
        assert_eq!(store.incr_window("rl", window).await.unwrap(), 1);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.incr_window("rl", window).await.unwrap(), 2);
        // 第二次自增不延长窗口 / the second increment does not extend the window
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.incr_window("rl", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_evicted_without_reads() {
        let store = MemoryCoordStore::new();
        for i in 0..20_001 {
            store
                .set_ex(&format!("presence:{}", i), "online", Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 20_001);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_keys() {
        let store = MemoryCoordStore::new();
        for i in 0..2 * SWEEP_EVERY_WRITES {
            store
                .incr_window(&format!("rl:{}:x", i), Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..SWEEP_EVERY_WRITES {
            store
                .set_ex("live", "v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_sets_and_outage() {
        let store = MemoryCoordStore::new();
        store.sadd("s", "a").await.unwrap();
        store.sadd("s", "b").await.unwrap();
        store.srem("s", "a").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["b".to_string()]);
        store.srem("s", "b").await.unwrap();
        assert!(!store.expire("s", Duration::from_secs(1)).await.unwrap());

        store.set_available(false);
        assert!(matches!(store.ping().await, Err(CoordError::Unavailable(_))));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
