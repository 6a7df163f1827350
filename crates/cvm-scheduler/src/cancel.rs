use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// One-shot cancellation signal shared between an owner and its workers.
///
/// Blocking waits register a wake callback with [`CancelToken::on_cancel`];
/// `cancel` sets the flag first and then runs every registered callback, so a
/// waiter that re-checks the flag under its own lock never misses a wakeup.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<Callback> = match self.inner.callbacks.lock() {
            Ok(g) => g.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect(),
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Runs `f` once if the token is cancelled while the registration lives.
    pub fn on_cancel(&self, f: impl Fn() + Send + Sync + 'static) -> CancelRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut g = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        g.push((id, Arc::new(f)));
        CancelRegistration {
            token: self.clone(),
            id,
        }
    }
}

#[must_use = "dropping the registration unregisters the callback"]
pub struct CancelRegistration {
    token: CancelToken,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        let mut g = self
            .token
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        g.retain(|(id, _)| *id != self.id);
    }
}
