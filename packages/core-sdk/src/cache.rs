use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/** \brief 模型与角色目录的缓存时长。 */
pub const CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

struct Entry<T> {
    payload: Arc<T>,
    captured_at: Instant,
}

/**
 * \brief 读穿透的短期缓存，保护很少变化的存储查询。
 * \details 命中检查只持有读锁；刷新期间不持锁，并发未命中可能重复刷新，后写者生效。
 */
pub struct TtlCache<T> {
    entry: RwLock<Option<Entry<T>>>,
    ttl: Duration,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /**
     * \brief 返回未过期的缓存快照，不触发刷新。
     */
    pub fn peek(&self) -> Option<Arc<T>> {
        let guard = self.entry.read();
        guard
            .as_ref()
            .filter(|e| e.captured_at.elapsed() < self.ttl)
            .map(|e| Arc::clone(&e.payload))
    }

    /**
     * \brief 命中则直接返回，否则调用 `refresh` 并整体替换缓存项。
     * \details 刷新失败时缓存保持不变，错误原样返回。
     */
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.peek() {
            return Ok(hit);
        }

        let payload = Arc::new(refresh().await?);
        *self.entry.write() = Some(Entry {
            payload: Arc::clone(&payload),
            captured_at: Instant::now(),
        });
        Ok(payload)
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}

impl<T> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new(CATALOG_TTL)
    }
}
