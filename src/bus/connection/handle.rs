//! Swappable broker client handle.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::bus::broker::ClientState;

type Factory<C> = Box<dyn Fn() -> Arc<C> + Send + Sync>;

/// Cell holding the current client handle.
///
/// Readers load the handle without locking. When the current handle reports
/// closed, the next caller builds a replacement and swaps it in; the old
/// handle is never mutated, so in-flight work on it finishes or fails on its
/// own.
pub(crate) struct HandleCell<C: ?Sized> {
    current: ArcSwap<Arc<C>>,
    factory: Factory<C>,
}

impl<C: ClientState + ?Sized> HandleCell<C> {
    pub(crate) fn new(factory: impl Fn() -> Arc<C> + Send + Sync + 'static) -> Self {
        Self {
            current: ArcSwap::from_pointee(factory()),
            factory: Box::new(factory),
        }
    }

    /// The current handle, closed or not.
    pub(crate) fn current(&self) -> Arc<C> {
        let guard = self.current.load();
        Arc::clone(&**guard)
    }

    /// A live handle, plus whether this call created it.
    ///
    /// Concurrent callers that all observe a closed handle race on the swap;
    /// losers adopt the winner's handle.
    pub(crate) fn get(&self) -> (Arc<C>, bool) {
        let observed = self.current.load_full();
        if !observed.is_closed_or_closing() {
            return (Arc::clone(&*observed), false);
        }

        let fresh = Arc::new((self.factory)());
        let previous = self.current.compare_and_swap(&observed, Arc::clone(&fresh));

        if Arc::ptr_eq(&*previous, &observed) {
            (Arc::clone(&*fresh), true)
        } else {
            (Arc::clone(&**previous), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeClient {
        id: usize,
        closed: AtomicBool,
    }

    impl ClientState for FakeClient {
        fn is_closed_or_closing(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn cell(built: Arc<AtomicUsize>) -> HandleCell<FakeClient> {
        HandleCell::new(move || {
            Arc::new(FakeClient {
                id: built.fetch_add(1, Ordering::SeqCst),
                closed: AtomicBool::new(false),
            })
        })
    }

    #[test]
    fn test_open_handle_is_reused() {
        let built = Arc::new(AtomicUsize::new(0));
        let cell = cell(built.clone());

        let (first, recreated) = cell.get();
        assert!(!recreated);
        let (second, _) = cell.get();

        assert_eq!(first.id, second.id);
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_handle_is_replaced() {
        let built = Arc::new(AtomicUsize::new(0));
        let cell = cell(built.clone());

        let (old, _) = cell.get();
        old.closed.store(true, Ordering::SeqCst);

        let (fresh, recreated) = cell.get();
        assert!(recreated);
        assert_ne!(old.id, fresh.id);
        assert!(!fresh.is_closed_or_closing());
        assert_eq!(cell.current().id, fresh.id);
    }

    #[test]
    fn test_current_does_not_recreate() {
        let built = Arc::new(AtomicUsize::new(0));
        let cell = cell(built.clone());

        cell.current().closed.store(true, Ordering::SeqCst);

        assert!(cell.current().is_closed_or_closing());
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_recreation_converges() {
        let built = Arc::new(AtomicUsize::new(0));
        let cell = Arc::new(cell(built.clone()));
        cell.current().closed.store(true, Ordering::SeqCst);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.get().0.id)
            })
            .collect();
        let ids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winner = cell.current().id;
        assert!(ids.iter().all(|id| *id == winner));
        assert!(!cell.current().is_closed_or_closing());
    }
}
