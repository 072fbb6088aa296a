use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

/// Forces failures, slow creates and watch terminations on a [`super::SimpleKVStore`].
///
/// Failure counters are consumed one per call, so `fail_gets(2)` fails exactly the next two
/// gets and lets the third one through.
#[derive(Debug)]
pub struct KVErrorInjector {
    fail_next_gets: AtomicUsize,
    fail_next_creates: AtomicUsize,
    fail_next_puts: AtomicUsize,
    fail_next_deletes: AtomicUsize,
    fail_next_watches: AtomicUsize,
    /// Close watch streams after N items (0 = disabled).
    close_watch_after_items: AtomicUsize,
    close_all_watches: AtomicBool,
    create_latency_ms: AtomicU64,
    watch_close_sender: broadcast::Sender<()>,
}

impl Default for KVErrorInjector {
    fn default() -> Self {
        let (watch_close_sender, _) = broadcast::channel(16);
        Self {
            fail_next_gets: AtomicUsize::new(0),
            fail_next_creates: AtomicUsize::new(0),
            fail_next_puts: AtomicUsize::new(0),
            fail_next_deletes: AtomicUsize::new(0),
            fail_next_watches: AtomicUsize::new(0),
            close_watch_after_items: AtomicUsize::new(0),
            close_all_watches: AtomicBool::new(false),
            create_latency_ms: AtomicU64::new(0),
            watch_close_sender,
        }
    }
}

impl KVErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_gets(&self, count: usize) {
        self.fail_next_gets.store(count, Ordering::Relaxed);
    }

    pub fn fail_creates(&self, count: usize) {
        self.fail_next_creates.store(count, Ordering::Relaxed);
    }

    pub fn fail_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::Relaxed);
    }

    pub fn fail_deletes(&self, count: usize) {
        self.fail_next_deletes.store(count, Ordering::Relaxed);
    }

    /// Fail the next N watch creations.
    pub fn fail_watches(&self, count: usize) {
        self.fail_next_watches.store(count, Ordering::Relaxed);
    }

    /// End every watch stream after it has emitted N items (0 = disabled).
    pub fn close_watch_after(&self, items: usize) {
        self.close_watch_after_items.store(items, Ordering::Relaxed);
    }

    /// End all open watch streams, and every watch created until
    /// [`Self::reset_close_all_watches`] is called.
    pub fn close_all_watch_streams(&self) {
        self.close_all_watches.store(true, Ordering::SeqCst);
        let _ = self.watch_close_sender.send(());
    }

    pub fn reset_close_all_watches(&self) {
        self.close_all_watches.store(false, Ordering::SeqCst);
    }

    /// Delay every create by `ms`, widening the window in which claims race.
    pub fn set_create_latency(&self, ms: u64) {
        self.create_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn watch_close_receiver(&self) -> broadcast::Receiver<()> {
        self.watch_close_sender.subscribe()
    }

    pub(crate) fn should_fail_get(&self) -> bool {
        Self::decrement_counter(&self.fail_next_gets)
    }

    pub(crate) fn should_fail_create(&self) -> bool {
        Self::decrement_counter(&self.fail_next_creates)
    }

    pub(crate) fn should_fail_put(&self) -> bool {
        Self::decrement_counter(&self.fail_next_puts)
    }

    pub(crate) fn should_fail_delete(&self) -> bool {
        Self::decrement_counter(&self.fail_next_deletes)
    }

    pub(crate) fn should_fail_watch(&self) -> bool {
        Self::decrement_counter(&self.fail_next_watches)
    }

    pub(crate) fn should_close_all_watches(&self) -> bool {
        self.close_all_watches.load(Ordering::SeqCst)
    }

    pub(crate) fn close_watch_after_items(&self) -> usize {
        self.close_watch_after_items.load(Ordering::Relaxed)
    }

    /// Returns true and decrements if the counter was non-zero.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    pub(crate) async fn apply_create_latency(&self) {
        let ms = self.create_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
