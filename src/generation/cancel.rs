use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Cooperative cancellation flag shared between a caller and one stream.
///
/// The stream checks it before forwarding each event; the engine call itself
/// is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type RequestId = u64;

type Entries = Mutex<HashMap<RequestId, CancellationToken>>;

/// Tokens of in-flight requests, addressable by id.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: Arc<Entries>,
    next_id: AtomicU64,
}

impl CancellationRegistry {
    pub fn register(&self, token: CancellationToken) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.entries).insert(id, token);
        Registration {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        match lock(&self.entries).get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Removes its entry from the registry when dropped.
#[derive(Debug)]
pub struct Registration {
    id: RequestId,
    entries: Weak<Entries>,
}

impl Registration {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            lock(&entries).remove(&self.id);
        }
    }
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}
