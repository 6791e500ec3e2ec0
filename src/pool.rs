//! Bounded/unbounded pool of reusable resources
//!
//! Codec support objects (deflaters, inflaters, I/O buffers) are expensive to
//! build and must never be shared between two in-flight messages. The pool
//! lends them out and takes them back without a lock on the hot path:
//!
//! - Idle objects live in a lock-free `SegQueue`
//! - The bounded case tracks the idle count with a compare-and-swap retry loop,
//!   so the count never exceeds the capacity
//! - Exceeding the capacity is not an error: the pool allocates or destroys instead
//!
//! Capacity semantics:
//!
//! | capacity | acquire | release |
//! |---|---|---|
//! | `0` | always allocates | always destroys |
//! | `N > 0` | takes idle or allocates | stores while fewer than `N` idle, else destroys |
//! | `< 0` | takes idle or allocates | always stores |

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use tracing::trace;

/// Capacity value meaning "no limit on idle objects"
pub const INFINITE_CAPACITY: isize = -1;

/// The owner-supplied operations of a pool
///
/// `new_object` allocates, `reset` restores an object to a clean reusable
/// state before it is stored, `end` destroys an object the pool will not keep.
pub trait PoolObjects: Send + Sync {
    /// The pooled resource type
    type Object: Send;

    /// Allocate a fresh object
    fn new_object(&self) -> Self::Object;

    /// Restore an object to a clean state before it goes back to the idle store
    fn reset(&self, object: &mut Self::Object);

    /// Release an object the pool will not keep
    fn end(&self, object: Self::Object) {
        drop(object);
    }
}

/// A pool of reusable objects with a runtime-tunable capacity
pub struct ResourcePool<M: PoolObjects> {
    objects: M,
    idle: SegQueue<M::Object>,
    /// Idle objects tracked against a bounded capacity
    idle_count: AtomicUsize,
    capacity: AtomicIsize,
    running: AtomicBool,
}

impl<M: PoolObjects> ResourcePool<M> {
    /// Create a running pool
    ///
    /// A capacity of zero disables pooling; any negative capacity is unbounded.
    pub fn new(capacity: isize, objects: M) -> Self {
        Self {
            objects,
            idle: SegQueue::new(),
            idle_count: AtomicUsize::new(0),
            capacity: AtomicIsize::new(normalize(capacity)),
            running: AtomicBool::new(true),
        }
    }

    /// Current capacity (`0` unpooled, `-1` unbounded)
    #[inline]
    pub fn capacity(&self) -> isize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Change the capacity
    ///
    /// Takes effect on the next acquire/release decision; objects already idle stay.
    pub fn set_capacity(&self, capacity: isize) {
        self.capacity.store(normalize(capacity), Ordering::Release);
    }

    /// The owner operations
    pub fn objects(&self) -> &M {
        &self.objects
    }

    /// Take an idle object, or allocate one
    ///
    /// Never blocks and never fails; the worst case is a fresh allocation.
    pub fn acquire(&self) -> M::Object {
        let capacity = self.capacity();
        if capacity == 0 {
            return self.objects.new_object();
        }

        match self.idle.pop() {
            Some(object) => {
                if capacity > 0 {
                    // Saturate: a capacity change may leave more idle objects than counted
                    let _ = self
                        .idle_count
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                }
                object
            }
            None => self.objects.new_object(),
        }
    }

    /// Return an object to the pool, or destroy it if the pool will not keep it
    ///
    /// Accepts `None` as a no-op so callers can hand back an optional slot.
    pub fn release(&self, object: impl Into<Option<M::Object>>) {
        let Some(mut object) = object.into() else {
            return;
        };

        let capacity = self.capacity();
        if capacity == 0 || !self.is_running() {
            self.objects.end(object);
            return;
        }

        if capacity < 0 {
            self.objects.reset(&mut object);
            self.idle.push(object);
            return;
        }

        let bound = capacity as usize;
        loop {
            let idle = self.idle_count.load(Ordering::Acquire);

            if idle >= bound {
                trace!(idle, capacity, "pool full, ending object");
                self.objects.end(object);
                return;
            }

            if self
                .idle_count
                .compare_exchange(idle, idle + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.objects.reset(&mut object);
                self.idle.push(object);
                return;
            }
        }
    }

    /// Number of idle objects held by the pool
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Whether released objects may be kept
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Resume pooling after a `stop`
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Drain the pool: end every idle object and reset the tracked count
    ///
    /// Until the next `start`, `release` destroys objects instead of storing them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);

        let mut drained = 0usize;
        while let Some(object) = self.idle.pop() {
            self.objects.end(object);
            drained += 1;
        }
        self.idle_count.store(0, Ordering::Release);

        trace!(drained, "pool stopped");
    }
}

impl<M: PoolObjects> Drop for ResourcePool<M> {
    fn drop(&mut self) {
        while let Some(object) = self.idle.pop() {
            self.objects.end(object);
        }
    }
}

impl<M: PoolObjects> fmt::Display for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_running() {
            "RUNNING"
        } else {
            "STOPPED"
        };
        let capacity = self.capacity();
        write!(f, "ResourcePool{{{},size={},capacity=", state, self.idle.len())?;
        if capacity < 0 {
            write!(f, "UNLIMITED}}")
        } else {
            write!(f, "{}}}", capacity)
        }
    }
}

impl<M: PoolObjects> fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity())
            .field("idle", &self.idle.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[inline]
fn normalize(capacity: isize) -> isize {
    if capacity < 0 {
        INFINITE_CAPACITY
    } else {
        capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    /// Counts every owner call; objects are numbered in allocation order
    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        resets: AtomicUsize,
        ended: AtomicUsize,
    }

    struct Slot {
        id: usize,
        dirty: bool,
    }

    impl PoolObjects for Counting {
        type Object = Slot;

        fn new_object(&self) -> Slot {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Slot { id, dirty: false }
        }

        fn reset(&self, object: &mut Slot) {
            self.resets.fetch_add(1, Ordering::SeqCst);
            object.dirty = false;
        }

        fn end(&self, _object: Slot) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn created(pool: &ResourcePool<Counting>) -> usize {
        pool.objects().created.load(Ordering::SeqCst)
    }

    #[test]
    fn test_unpooled_capacity_zero() {
        let pool = ResourcePool::new(0, Counting::default());

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.objects().created.load(Ordering::SeqCst), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);

        let _c = pool.acquire();
        assert_eq!(pool.objects().created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.objects().resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bounded_capacity_two() {
        let pool = ResourcePool::new(2, Counting::default());

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(created(&pool), 3);

        pool.release(a);
        pool.release(b);
        pool.release(c);

        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 1);
        assert_eq!(pool.objects().resets.load(Ordering::SeqCst), 2);

        let mut d = pool.acquire();
        assert_eq!(created(&pool), 3);
        assert!(!d.dirty);
        assert_eq!(pool.idle_count(), 1);

        d.dirty = true;
        pool.release(d);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_bounded_counter_tracks_acquire() {
        let pool = ResourcePool::new(1, Counting::default());

        let a = pool.acquire();
        pool.release(a);
        assert_eq!(pool.idle_count(), 1);

        // Taking the idle object frees its slot for the next release
        let b = pool.acquire();
        pool.release(b);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_none_is_noop() {
        let pool = ResourcePool::new(2, Counting::default());
        pool.release(None);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unbounded_concurrent_release() {
        const THREADS: usize = 16;

        let pool = Arc::new(ResourcePool::new(INFINITE_CAPACITY, Counting::default()));
        let objects: Vec<Slot> = (0..THREADS).map(|_| pool.acquire()).collect();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = objects
            .into_iter()
            .map(|object| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pool.release(object);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.idle_count(), THREADS);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 0);

        let mut seen = HashSet::new();
        for _ in 0..THREADS {
            let object = pool.acquire();
            assert!(seen.insert(object.id), "object {} pooled twice", object.id);
        }
        assert_eq!(created(&pool), THREADS);
    }

    #[test]
    fn test_bounded_concurrent_never_exceeds_capacity() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;
        const CAPACITY: usize = 3;

        let pool = Arc::new(ResourcePool::new(CAPACITY as isize, Counting::default()));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let object = pool.acquire();
                        pool.release(object);
                        assert!(pool.idle_count() <= CAPACITY);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.idle_count() <= CAPACITY);
        let counts = pool.objects();
        assert_eq!(
            counts.created.load(Ordering::SeqCst),
            counts.ended.load(Ordering::SeqCst) + pool.idle_count()
        );
    }

    #[test]
    fn test_stop_drains_and_destroys_later_releases() {
        let pool = ResourcePool::new(4, Counting::default());

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 2);

        pool.stop();
        assert!(!pool.is_running());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 2);

        pool.release(c);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 3);

        pool.start();
        let d = pool.acquire();
        pool.release(d);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_capacity_change_is_not_retroactive() {
        let pool = ResourcePool::new(INFINITE_CAPACITY, Counting::default());

        let objects: Vec<Slot> = (0..4).map(|_| pool.acquire()).collect();
        for object in objects {
            pool.release(object);
        }
        assert_eq!(pool.idle_count(), 4);

        pool.set_capacity(1);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.idle_count(), 4);

        // Bounded accounting starts from the new setting
        let extra = pool.objects().new_object();
        pool.release(extra);
        assert_eq!(pool.idle_count(), 5);
        let extra = pool.objects().new_object();
        pool.release(extra);
        assert_eq!(pool.idle_count(), 5);
        assert_eq!(pool.objects().ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_negative_capacity_normalized() {
        let pool = ResourcePool::new(-42, Counting::default());
        assert_eq!(pool.capacity(), INFINITE_CAPACITY);
    }

    #[test]
    fn test_display() {
        let pool = ResourcePool::new(INFINITE_CAPACITY, Counting::default());
        let object = pool.acquire();
        pool.release(object);
        assert_eq!(
            pool.to_string(),
            "ResourcePool{RUNNING,size=1,capacity=UNLIMITED}"
        );

        pool.set_capacity(8);
        pool.stop();
        assert_eq!(pool.to_string(), "ResourcePool{STOPPED,size=0,capacity=8}");
    }
}
