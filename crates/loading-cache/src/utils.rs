/// Runs a callback when the container is dropped.
///
/// Used to tie cleanup work to the lifetime of a spawned future, so the
/// cleanup also runs when the future is dropped before completing. The
/// callback must not panic; it may be invoked during unwinding.
pub(crate) struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    pub(crate) fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}
