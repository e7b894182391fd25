//! The branch event bus: `branch_discovered`/`branch_queried`/
//! `connect_finished`/`connection_lost` notifications fanned out to a
//! single pending observer.
//!
//! Installing a new observer while one is pending cancels the previous
//! one; dropping the [`EventBus`] (i.e. the owning branch) completes any
//! still-pending observer with `canceled`, using per-operation
//! cancellation tokens rather than shared/weak self-handles.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::branch::Uuid;
use yogi_transport::context::Context;
use yogi_transport::error::YogiErrorCode;

/// The four event kinds the branch event bus raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BranchDiscovered,
    BranchQueried,
    ConnectFinished,
    ConnectionLost,
}

/// A raised event: which branch it concerns, what kind it is, the
/// outcome (`Ok(())` for success or the specific failure code), and a
/// JSON blob describing it further (payload format is an application
/// concern; the core only carries the bytes).
#[derive(Debug, Clone)]
pub struct BranchEvent {
    pub uuid: Uuid,
    pub kind: EventKind,
    pub result: Result<(), YogiErrorCode>,
    pub json: String,
}

impl BranchEvent {
    /// Copies the JSON blob into `buf` as a NUL-terminated (possibly
    /// truncated) C-string-shaped prefix, for callers that provide a
    /// writable buffer instead of taking an owned `String`. Returns
    /// `Ok(bytes_written)` if the full blob (plus NUL) fit, or
    /// `Err(BufferTooSmall)` with `buf` holding a truncated,
    /// NUL-terminated prefix otherwise.
    pub fn write_json_into(&self, buf: &mut [u8]) -> Result<usize, YogiErrorCode> {
        let bytes = self.json.as_bytes();
        if buf.is_empty() {
            return Err(YogiErrorCode::BufferTooSmall);
        }
        if bytes.len() + 1 <= buf.len() {
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[bytes.len()] = 0;
            Ok(bytes.len() + 1)
        } else {
            let prefix_len = buf.len() - 1;
            buf[..prefix_len].copy_from_slice(&bytes[..prefix_len]);
            buf[prefix_len] = 0;
            Err(YogiErrorCode::BufferTooSmall)
        }
    }
}

/// What a pending observer's handler is invoked with.
pub enum EventOutcome {
    Delivered(BranchEvent),
    Canceled,
}

type ObserverHandler = Box<dyn FnOnce(&Context, EventOutcome) + Send>;

struct Inner {
    queue: VecDeque<BranchEvent>,
    observer: Option<ObserverHandler>,
}

/// Per-branch event bus. Cheap to clone; all clones share the same
/// queue/observer slot.
#[derive(Clone)]
pub struct EventBus {
    context: Context,
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                observer: None,
            })),
        }
    }

    /// Raises `event`. If an observer is currently pending, it is
    /// delivered immediately (posted to the context); otherwise the
    /// event is queued for the next `await_event` call.
    pub fn publish(&self, event: BranchEvent) {
        let handler = {
            let mut inner = self.inner.lock();
            if let Some(handler) = inner.observer.take() {
                Some(handler)
            } else {
                inner.queue.push_back(event.clone());
                None
            }
        };
        if let Some(handler) = handler {
            self.context.post(move |ctx| handler(ctx, EventOutcome::Delivered(event)));
        }
    }

    /// Registers `handler` to be invoked with the next event. If an
    /// event is already queued, it is delivered immediately (posted to
    /// the context). If another observer was already pending, that one
    /// is completed with [`EventOutcome::Canceled`] first.
    pub fn await_event(&self, handler: impl FnOnce(&Context, EventOutcome) + Send + 'static) {
        let (previous, immediate) = {
            let mut inner = self.inner.lock();
            let previous = inner.observer.take();
            if let Some(event) = inner.queue.pop_front() {
                (previous, Some(event))
            } else {
                inner.observer = Some(Box::new(handler));
                (previous, None)
            }
        };
        if let Some(previous) = previous {
            self.context.post(move |ctx| previous(ctx, EventOutcome::Canceled));
        }
        if let Some(event) = immediate {
            self.context.post(move |ctx| handler(ctx, EventOutcome::Delivered(event)));
        }
    }

    /// Completes the pending observer (if any) with
    /// [`EventOutcome::Canceled`]. Returns `Err(OperationNotRunning)` if
    /// no observer was pending.
    pub fn cancel_await_event(&self) -> Result<(), YogiErrorCode> {
        let observer = self.inner.lock().observer.take();
        match observer {
            Some(handler) => {
                self.context.post(move |ctx| handler(ctx, EventOutcome::Canceled));
                Ok(())
            }
            None => Err(YogiErrorCode::OperationNotRunning),
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Only the last strong reference tears down the observer; clones
        // sharing the same `Arc<Mutex<Inner>>` are the normal case while
        // the branch that owns this bus is still alive.
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        if let Some(handler) = self.inner.lock().observer.take() {
            self.context.post(move |ctx| handler(ctx, EventOutcome::Canceled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sample_event(kind: EventKind) -> BranchEvent {
        BranchEvent {
            uuid: Uuid::from_bytes([1; 16]),
            kind,
            result: Ok(()),
            json: "{}".to_string(),
        }
    }

    #[test]
    fn await_then_publish_delivers() {
        let ctx = Context::new().unwrap();
        let bus = EventBus::new(ctx.clone());
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&delivered);
        bus.await_event(move |_, outcome| {
            assert!(matches!(outcome, EventOutcome::Delivered(_)));
            d.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(sample_event(EventKind::BranchDiscovered));
        ctx.poll();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_then_await_delivers_queued_event() {
        let ctx = Context::new().unwrap();
        let bus = EventBus::new(ctx.clone());
        bus.publish(sample_event(EventKind::BranchQueried));
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&delivered);
        bus.await_event(move |_, outcome| {
            assert!(matches!(outcome, EventOutcome::Delivered(_)));
            d.fetch_add(1, Ordering::SeqCst);
        });
        ctx.poll();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn installing_new_observer_cancels_previous() {
        let ctx = Context::new().unwrap();
        let bus = EventBus::new(ctx.clone());
        let first_outcome = Arc::new(Mutex::new(None));
        let fo = Arc::clone(&first_outcome);
        bus.await_event(move |_, outcome| {
            *fo.lock() = Some(matches!(outcome, EventOutcome::Canceled));
        });
        bus.await_event(|_, _| {});
        ctx.poll();
        assert_eq!(*first_outcome.lock(), Some(true));
    }

    #[test]
    fn cancel_await_event_without_pending_observer_fails() {
        let ctx = Context::new().unwrap();
        let bus = EventBus::new(ctx);
        assert_eq!(
            bus.cancel_await_event().unwrap_err(),
            YogiErrorCode::OperationNotRunning
        );
    }

    #[test]
    fn cancel_await_event_cancels_pending_observer() {
        let ctx = Context::new().unwrap();
        let bus = EventBus::new(ctx.clone());
        let canceled = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&canceled);
        bus.await_event(move |_, outcome| {
            if matches!(outcome, EventOutcome::Canceled) {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.cancel_await_event().unwrap();
        ctx.poll();
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn json_blob_truncation_is_nul_terminated() {
        let event = sample_event(EventKind::ConnectFinished);
        let mut event = event;
        event.json = "abcdef".to_string();
        let mut buf = [0xffu8; 4];
        let err = event.write_json_into(&mut buf).unwrap_err();
        assert_eq!(err, YogiErrorCode::BufferTooSmall);
        assert_eq!(&buf, b"abc\0");
    }

    #[test]
    fn drop_cancels_pending_observer() {
        let ctx = Context::new().unwrap();
        let canceled = Arc::new(AtomicUsize::new(0));
        {
            let bus = EventBus::new(ctx.clone());
            let c = Arc::clone(&canceled);
            bus.await_event(move |_, outcome| {
                if matches!(outcome, EventOutcome::Canceled) {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        ctx.poll();
        std::thread::sleep(Duration::from_millis(10));
        ctx.poll();
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
    }
}
