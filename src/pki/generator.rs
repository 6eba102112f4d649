use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use crate::peertls::Error;
use crate::pki::{NodeId, PrivateKey};

/// Cooperative cancellation flag shared between the generator workers and
/// whoever drives them (timeout timer, Ctrl-C handler).
///
/// Tokens form a chain: a child observes its own flag and every ancestor's,
/// so cancelling an outer token stops all derived work.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a token that is cancelled when either it or `self` is.
    pub fn child(&self) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(|p| p.is_cancelled())
    }
}

/// Generates keys until one meets `min_difficulty`. Single-threaded; checks
/// the cancellation token at the top of each iteration.
pub fn generate_key(
    cancel: &CancelToken,
    min_difficulty: u16,
) -> Result<(PrivateKey, NodeId), Error> {
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let key = PrivateKey::generate()?;
        let id = NodeId::from_public_key_der(&key.public_key_der())?;
        if id.difficulty() >= min_difficulty {
            return Ok((key, id));
        }
    }
}

/// Runs up to `concurrency` worker threads, each generating random keys and
/// feeding every candidate that meets `min_difficulty` into `found`.
///
/// `found` returns `Ok(true)` to stop successfully, `Ok(false)` to keep
/// searching, or an error to abort the whole operation. The first decisive
/// worker outcome wins; the remaining workers are stopped cooperatively via
/// a child token. Cancelling `cancel` aborts with `Error::Cancelled`.
///
/// No ordering is guaranteed between workers.
pub fn generate_keys<F>(
    cancel: &CancelToken,
    min_difficulty: u16,
    concurrency: usize,
    found: F,
) -> Result<(), Error>
where
    F: Fn(PrivateKey, NodeId) -> Result<bool, Error> + Sync,
{
    let concurrency = concurrency.max(1);
    let inner = cancel.child();
    let (tx, rx) = mpsc::channel::<Result<(), Error>>();

    thread::scope(|scope| {
        for _ in 0..concurrency {
            let tx = tx.clone();
            let inner = &inner;
            let found = &found;
            scope.spawn(move || loop {
                let (key, id) = match generate_key(inner, min_difficulty) {
                    Ok(pair) => pair,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                match found(key, id) {
                    Ok(false) => continue,
                    Ok(true) => {
                        let _ = tx.send(Ok(()));
                        return;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                }
            });
        }
        drop(tx);

        // Only the first outcome matters; later messages are either
        // cancellation noise from the losing workers or duplicates.
        let first = rx.recv().unwrap_or(Err(Error::Cancelled));
        inner.cancel();
        first
    })
}
