//! Free-list of reset barrels shared by one store variant

use super::barrel::{Barrel, BarrelLimits};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded pool of barrels. Barrels handed back are reset before they are
/// kept, so an acquired barrel never carries data from a previous key.
pub struct BarrelPool {
    free: Mutex<Vec<Barrel>>,
    max_idle: usize,
    limits: BarrelLimits,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl BarrelPool {
    pub fn new(limits: BarrelLimits, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            limits,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, key: &str) -> Barrel {
        match self.free.lock().pop() {
            Some(mut barrel) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                barrel.rebind(key.to_string(), self.limits);
                barrel
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Barrel::new(key, self.limits)
            }
        }
    }

    /// Reset `barrel` and keep it for reuse if the pool has room.
    pub fn release(&self, mut barrel: Barrel) {
        barrel.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(barrel);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageEnvelope;
    use std::sync::Arc;

    #[test]
    fn test_reused_barrel_is_clean() {
        let pool = BarrelPool::new(BarrelLimits::default(), 4);
        let barrel = pool.acquire("first");
        barrel.insert(Arc::new(MessageEnvelope::new("first", "hello")), true);
        let _rx = barrel.subscribe("s", false);
        pool.release(barrel);
        assert_eq!(pool.idle(), 1);

        let barrel = pool.acquire("second");
        assert_eq!(barrel.key(), "second");
        assert_eq!(barrel.window_len(), 0);
        assert_eq!(barrel.pending_len(), 0);
        assert_eq!(barrel.subscriber_count(), 0);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BarrelPool::new(BarrelLimits::default(), 1);
        let a = pool.acquire("a");
        let b = pool.acquire("b");
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }
}
