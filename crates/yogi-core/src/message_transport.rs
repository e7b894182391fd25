//! The framed Message Transport: turns a raw [`ByteTransport`] into a
//! transport of whole, length-prefixed messages.
//!
//! The TX side stages complete frames in a ring buffer and drains them
//! to the byte transport one contiguous span at a time; the RX side
//! fills the same kind of ring from the byte transport and peels off
//! whole messages for whichever receiver is currently waiting. Both
//! directions latch the first fatal error they see and stay latched.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use yogi_transport::byte_transport::ByteTransport;
use yogi_transport::context::{CallContext, Context};
use yogi_transport::error::{YogiError, YogiErrorCode};

use crate::ring::{self, Consumer, Producer};
use crate::varint;

type SendHandler = Box<dyn FnOnce(&Context, Result<(), YogiErrorCode>) + Send>;
type RecvHandler = Box<dyn FnOnce(&Context, RecvOutcome) + Send>;

/// The outcome delivered to a [`MessageTransport::recv_async`] handler.
/// The buffer passed into `recv_async` is always handed back so callers
/// can reuse its allocation for the next receive.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A full message of `size` bytes was copied into `buf[..size]`.
    Delivered { buf: Vec<u8>, size: usize },
    /// A message of `size` bytes arrived but `buf` was shorter than
    /// that; `buf` holds the leading `buf.len()` bytes and the
    /// remainder was discarded from the ring.
    BufferTooSmall { buf: Vec<u8>, size: usize },
    /// The receive could not complete; `buf` is handed back untouched.
    Failed { buf: Vec<u8>, error: YogiErrorCode },
}

struct PendingSend {
    tag: u64,
    bytes: Bytes,
    handler: SendHandler,
}

struct PendingRecv {
    buf: Vec<u8>,
    handler: RecvHandler,
}

struct TxState {
    send_to_transport_running: bool,
    pending_sends: VecDeque<PendingSend>,
    last_error: Option<YogiErrorCode>,
}

struct RxState {
    receive_from_transport_running: bool,
    pending: Option<PendingRecv>,
    decoded_size: Option<usize>,
    last_error: Option<YogiErrorCode>,
}

/// Frames messages over a [`ByteTransport`].
///
/// `try_send`/`send_async`/`cancel_send`/`recv_async`/`cancel_recv`/
/// `close` may be called from any thread; every handler they invoke is
/// posted onto the owning [`Context`] so it only ever runs under
/// `poll`/`run`/`run_one`, matching the rest of this workspace's
/// completion-handler discipline.
pub struct MessageTransport<T: ByteTransport> {
    context: Context,
    transport: Arc<T>,
    tx_producer: Producer,
    tx_consumer: Consumer,
    rx_producer: Producer,
    rx_consumer: Consumer,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    started: AtomicBool,
    close_invoked: AtomicBool,
    io_timeout: Option<Duration>,
}

impl<T: ByteTransport> MessageTransport<T> {
    /// Builds a transport with the given TX/RX ring capacities (in
    /// bytes) and a per-I/O-operation timeout (`None` means infinite).
    pub fn new(
        context: Context,
        transport: Arc<T>,
        tx_queue_size: usize,
        rx_queue_size: usize,
        io_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (tx_producer, tx_consumer) = ring::ring_buffer(tx_queue_size);
        let (rx_producer, rx_consumer) = ring::ring_buffer(rx_queue_size);
        Arc::new(Self {
            context,
            transport,
            tx_producer,
            tx_consumer,
            rx_producer,
            rx_consumer,
            tx: Mutex::new(TxState {
                send_to_transport_running: false,
                pending_sends: VecDeque::new(),
                last_error: None,
            }),
            rx: Mutex::new(RxState {
                receive_from_transport_running: false,
                pending: None,
                decoded_size: None,
                last_error: None,
            }),
            started: AtomicBool::new(false),
            close_invoked: AtomicBool::new(false),
            io_timeout,
        })
    }

    /// Begins filling the RX ring from the underlying transport. Safe to
    /// call more than once; only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.kick_rx();
    }

    /// Attempts to send `payload` without queuing. Returns `Ok(true)` if
    /// the framed message was copied into the TX ring immediately,
    /// `Ok(false)` if it would have to wait (the caller should fall back
    /// to [`MessageTransport::send_async`]), or `Err` if the transport
    /// has latched a fatal error or `payload` can never fit the ring.
    pub fn try_send(self: &Arc<Self>, payload: &[u8]) -> Result<bool, YogiError> {
        let frame = Self::build_frame(payload, self.tx_producer.capacity())?;

        let mut state = self.tx.lock();
        if let Some(code) = state.last_error {
            return Err(YogiError::from(code));
        }
        if !state.pending_sends.is_empty() || self.tx_producer.free_space() < frame.len() {
            return Ok(false);
        }
        let written = self.tx_producer.write(&frame);
        debug_assert_eq!(written, frame.len());
        drop(state);
        self.kick_tx();
        Ok(true)
    }

    /// Queues `payload` for sending, invoking `handler(ctx, status)` on
    /// the owning context once it either reaches the TX ring (fast
    /// path) or is later drained from `pending_sends`. `tag` is an
    /// opaque caller-chosen cancellation handle; `0` means "not
    /// cancelable". Passing an already-pending nonzero tag is a caller
    /// contract violation (debug-checked only).
    pub fn send_async(
        self: &Arc<Self>,
        payload: &[u8],
        tag: u64,
        handler: impl FnOnce(&Context, Result<(), YogiErrorCode>) + Send + 'static,
    ) {
        let frame = match Self::build_frame(payload, self.tx_producer.capacity()) {
            Ok(frame) => frame,
            Err(err) => {
                let code = err.code();
                self.context.post(move |ctx| handler(ctx, Err(code)));
                return;
            }
        };

        let mut state = self.tx.lock();
        if let Some(code) = state.last_error {
            drop(state);
            self.context.post(move |ctx| handler(ctx, Err(code)));
            return;
        }
        debug_assert!(
            tag == 0 || !state.pending_sends.iter().any(|entry| entry.tag == tag),
            "send_async called with a tag that already has a pending send"
        );
        if state.pending_sends.is_empty() && self.tx_producer.free_space() >= frame.len() {
            let written = self.tx_producer.write(&frame);
            debug_assert_eq!(written, frame.len());
            drop(state);
            self.kick_tx();
            self.context.post(move |ctx| handler(ctx, Ok(())));
            return;
        }
        state.pending_sends.push_back(PendingSend {
            tag,
            bytes: frame,
            handler: Box::new(handler),
        });
        drop(state);
        self.kick_tx();
    }

    /// Cancels a still-pending send registered with a nonzero `tag`.
    /// Returns `false` if `tag` is `0` or no longer has a pending entry
    /// (it may already have reached the TX ring).
    pub fn cancel_send(self: &Arc<Self>, tag: u64) -> bool {
        if tag == 0 {
            return false;
        }
        let entry = {
            let mut state = self.tx.lock();
            state
                .pending_sends
                .iter()
                .position(|entry| entry.tag == tag)
                .map(|pos| state.pending_sends.remove(pos).expect("position just found"))
        };
        match entry {
            Some(entry) => {
                let handler = entry.handler;
                self.context
                    .post(move |ctx| handler(ctx, Err(YogiErrorCode::Canceled)));
                true
            }
            None => false,
        }
    }

    /// Registers a one-shot receiver. Exactly one receive may be pending
    /// at a time (debug-checked). If a complete message is already
    /// buffered, delivery is posted immediately; otherwise it completes
    /// once enough bytes arrive from the transport.
    pub fn recv_async(
        self: &Arc<Self>,
        buf: Vec<u8>,
        handler: impl FnOnce(&Context, RecvOutcome) + Send + 'static,
    ) {
        let mut state = self.rx.lock();
        if let Some(code) = state.last_error {
            drop(state);
            self.context
                .post(move |ctx| handler(ctx, RecvOutcome::Failed { buf, error: code }));
            return;
        }
        debug_assert!(
            state.pending.is_none(),
            "recv_async called while a receive is already pending"
        );
        state.pending = Some(PendingRecv {
            buf,
            handler: Box::new(handler),
        });
        drop(state);
        self.try_deliver_pending_recv();
    }

    /// Cancels the pending receive, if any. Returns `false` if nothing
    /// was pending.
    pub fn cancel_recv(self: &Arc<Self>) -> bool {
        let pending = self.rx.lock().pending.take();
        match pending {
            Some(pending) => {
                let PendingRecv { buf, handler } = pending;
                self.context.post(move |ctx| {
                    handler(ctx, RecvOutcome::Failed { buf, error: YogiErrorCode::Canceled })
                });
                true
            }
            None => false,
        }
    }

    /// The first fatal error latched by either direction, if any. Lets a
    /// connection manager poll an installed transport for liveness
    /// without consuming the single `recv_async` slot an application
    /// caller would otherwise need.
    pub fn last_error(&self) -> Option<YogiErrorCode> {
        self.tx.lock().last_error.or(self.rx.lock().last_error)
    }

    /// Forwards to the underlying [`ByteTransport`], latching
    /// `rw_failed` (unless a more specific error is already latched) on
    /// both directions and draining any pending send/receive with it.
    /// Idempotent: the underlying transport is closed exactly once
    /// regardless of how many times this is called or which side fails
    /// first.
    pub fn close(self: &Arc<Self>) {
        self.fail(YogiErrorCode::RwFailed);
    }

    fn build_frame(payload: &[u8], tx_capacity: usize) -> Result<Bytes, YogiError> {
        let mut frame = varint::encode(payload.len() as u64)?;
        frame.extend_from_slice(payload);
        if frame.len() > tx_capacity {
            return Err(YogiError::new(
                YogiErrorCode::PayloadTooLarge,
                format!(
                    "framed message of {} bytes can never fit the {}-byte tx queue",
                    frame.len(),
                    tx_capacity
                ),
            ));
        }
        Ok(Bytes::from(frame))
    }

    fn io_call_context(&self) -> CallContext {
        match self.io_timeout {
            Some(timeout) => CallContext::with_timeout(timeout),
            None => CallContext::infinite(),
        }
    }

    fn kick_tx(self: &Arc<Self>) {
        let should_spawn = {
            let mut state = self.tx.lock();
            if state.send_to_transport_running || state.last_error.is_some() || self.tx_consumer.is_empty() {
                false
            } else {
                state.send_to_transport_running = true;
                true
            }
        };
        if should_spawn {
            self.spawn_tx_send();
        }
    }

    fn spawn_tx_send(self: &Arc<Self>) {
        let chunk = self.tx_consumer.first_read_array().to_vec();
        debug_assert!(!chunk.is_empty(), "kick_tx only spawns when the tx ring is non-empty");
        let attempted = chunk.len();
        let mt = Arc::clone(self);
        let transport = Arc::clone(&self.transport);
        let io_ctx = self.io_call_context();
        self.context.spawn_io(
            async move { transport.send_some(&chunk, &io_ctx).await },
            move |ctx, result| mt.on_tx_send_complete(ctx, result, attempted),
        );
    }

    fn on_tx_send_complete(
        self: &Arc<Self>,
        _ctx: &Context,
        result: Result<usize, YogiError>,
        attempted: usize,
    ) {
        match result {
            Ok(n) => {
                debug_assert!(n <= attempted);
                self.tx_consumer.commit_first_read_array(n);
                self.flush_pending_sends();
                let continue_draining = {
                    let mut state = self.tx.lock();
                    if self.tx_consumer.is_empty() {
                        state.send_to_transport_running = false;
                        false
                    } else {
                        true
                    }
                };
                if continue_draining {
                    self.spawn_tx_send();
                }
            }
            Err(err) => self.fail(err.code()),
        }
    }

    /// Retries queued sends in FIFO order, writing each into the TX ring
    /// as room frees up. Stops at the first entry that still doesn't
    /// fit, preserving submission order.
    fn flush_pending_sends(self: &Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.tx.lock();
                match state.pending_sends.front() {
                    Some(front) if self.tx_producer.free_space() >= front.bytes.len() => {
                        state.pending_sends.pop_front()
                    }
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            let written = self.tx_producer.write(&entry.bytes);
            debug_assert_eq!(written, entry.bytes.len());
            let handler = entry.handler;
            self.context.post(move |ctx| handler(ctx, Ok(())));
        }
    }

    fn kick_rx(self: &Arc<Self>) {
        let should_spawn = {
            let mut state = self.rx.lock();
            if state.receive_from_transport_running
                || state.last_error.is_some()
                || self.rx_producer.free_space() == 0
            {
                false
            } else {
                state.receive_from_transport_running = true;
                true
            }
        };
        if should_spawn {
            self.spawn_rx_recv();
        }
    }

    fn spawn_rx_recv(self: &Arc<Self>) {
        let len = self.rx_producer.first_write_array().len();
        debug_assert!(len > 0, "kick_rx only spawns when the rx ring has free space");
        let mt = Arc::clone(self);
        let transport = Arc::clone(&self.transport);
        let io_ctx = self.io_call_context();
        self.context.spawn_io(
            async move {
                let mut buf = vec![0u8; len];
                let result = transport.recv_some(&mut buf, &io_ctx).await;
                (buf, result)
            },
            move |ctx, (buf, result)| mt.on_rx_recv_complete(ctx, buf, result),
        );
    }

    fn on_rx_recv_complete(
        self: &Arc<Self>,
        _ctx: &Context,
        buf: Vec<u8>,
        result: Result<usize, YogiError>,
    ) {
        match result {
            Ok(n) => {
                if n > 0 {
                    let written = self.rx_producer.write(&buf[..n]);
                    debug_assert_eq!(written, n);
                }
                self.try_deliver_pending_recv();
                let continue_filling = {
                    let mut state = self.rx.lock();
                    if self.rx_producer.free_space() == 0 {
                        state.receive_from_transport_running = false;
                        false
                    } else {
                        true
                    }
                };
                if continue_filling {
                    self.spawn_rx_recv();
                }
            }
            Err(err) => self.fail(err.code()),
        }
    }

    /// Attempts to satisfy the currently pending receive (if any) from
    /// bytes already buffered in the RX ring: first the size field (a
    /// bounded peek of at most five bytes, never an unbounded scan, so a
    /// corrupt size field fails exactly at the sixth continuation byte),
    /// then the payload once enough of it has
    /// arrived. Holds the RX lock across every RX-ring access in this
    /// function since `recv_async`'s fast path and the RX refill loop
    /// can both reach here concurrently, and the ring only tolerates one
    /// reader at a time.
    fn try_deliver_pending_recv(self: &Arc<Self>) {
        let mut state = self.rx.lock();
        if state.pending.is_none() {
            return;
        }

        if state.decoded_size.is_none() {
            let peeked = self.rx_consumer.peek(5);
            match varint::decode(&peeked) {
                Ok(Some((size, consumed))) => {
                    self.rx_consumer.discard(consumed);
                    if size as usize > self.rx_consumer.capacity() {
                        drop(state);
                        self.fail(YogiErrorCode::DeserializeMsgFailed);
                        return;
                    }
                    state.decoded_size = Some(size as usize);
                }
                Ok(None) => return,
                Err(_) => {
                    drop(state);
                    self.fail(YogiErrorCode::DeserializeMsgFailed);
                    return;
                }
            }
        }

        let size = state.decoded_size.expect("decoded_size set just above");
        if self.rx_consumer.size() < size {
            return;
        }

        let pending = state.pending.take().expect("checked at function entry");
        state.decoded_size = None;

        let PendingRecv { mut buf, handler } = pending;
        if buf.len() >= size {
            let read = self.rx_consumer.read(&mut buf[..size]);
            debug_assert_eq!(read, size);
            drop(state);
            self.context
                .post(move |ctx| handler(ctx, RecvOutcome::Delivered { buf, size }));
        } else {
            let prefix_len = buf.len();
            let read = self.rx_consumer.read(&mut buf);
            debug_assert_eq!(read, prefix_len);
            self.rx_consumer.discard(size - prefix_len);
            drop(state);
            self.context
                .post(move |ctx| handler(ctx, RecvOutcome::BufferTooSmall { buf, size }));
        }
    }

    /// Latches `code` into whichever of the TX/RX sticky-error fields
    /// doesn't already have one, drains `pending_sends` and any pending
    /// receive with the latched code, and closes the underlying
    /// transport exactly once.
    fn fail(self: &Arc<Self>, code: YogiErrorCode) {
        let (tx_effective, tx_entries) = {
            let mut state = self.tx.lock();
            if state.last_error.is_none() {
                state.last_error = Some(code);
            }
            state.send_to_transport_running = false;
            (
                state.last_error.expect("just set above"),
                state.pending_sends.drain(..).collect::<Vec<_>>(),
            )
        };
        let (rx_effective, rx_pending) = {
            let mut state = self.rx.lock();
            if state.last_error.is_none() {
                state.last_error = Some(code);
            }
            state.receive_from_transport_running = false;
            (state.last_error.expect("just set above"), state.pending.take())
        };

        for entry in tx_entries {
            let handler = entry.handler;
            self.context.post(move |ctx| handler(ctx, Err(tx_effective)));
        }
        if let Some(pending) = rx_pending {
            let PendingRecv { buf, handler } = pending;
            self.context.post(move |ctx| {
                handler(ctx, RecvOutcome::Failed { buf, error: rx_effective })
            });
        }

        if !self.close_invoked.swap(true, Ordering::AcqRel) {
            let transport = Arc::clone(&self.transport);
            self.context.io_handle().spawn(async move {
                transport.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use yogi_transport::TransportSocketAddr;
    use yogi_transport::shutdown::ShutdownDirection;

    struct FakeTransport {
        sent: Mutex<Vec<u8>>,
        recv_chunks: Mutex<VecDeque<Vec<u8>>>,
        send_blocked: StdAtomicBool,
        send_notify: Notify,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                recv_chunks: Mutex::new(VecDeque::new()),
                send_blocked: StdAtomicBool::new(false),
                send_notify: Notify::new(),
            }
        }

        fn push_recv_chunk(&self, chunk: Vec<u8>) {
            self.recv_chunks.lock().push_back(chunk);
        }

        fn sent_bytes(&self) -> Vec<u8> {
            self.sent.lock().clone()
        }

        fn block_sends(&self) {
            self.send_blocked.store(true, Ordering::Release);
        }

        fn unblock_sends(&self) {
            self.send_blocked.store(false, Ordering::Release);
            self.send_notify.notify_waiters();
        }
    }

    #[async_trait]
    impl ByteTransport for FakeTransport {
        fn peer_addr(&self) -> Option<TransportSocketAddr> {
            None
        }

        fn local_addr(&self) -> Option<TransportSocketAddr> {
            None
        }

        async fn send_some(&self, buf: &[u8], _ctx: &CallContext) -> Result<usize, YogiError> {
            while self.send_blocked.load(Ordering::Acquire) {
                self.send_notify.notified().await;
            }
            self.sent.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn recv_some(&self, buf: &mut [u8], _ctx: &CallContext) -> Result<usize, YogiError> {
            loop {
                let chunk = self.recv_chunks.lock().pop_front();
                if let Some(chunk) = chunk {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        async fn shutdown(&self, _direction: ShutdownDirection, _ctx: &CallContext) -> Result<(), YogiError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn drive_until(ctx: &Context, predicate: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return true;
            }
            if Instant::now() >= deadline {
                return predicate();
            }
            ctx.run(Duration::from_millis(20));
        }
    }

    #[test]
    fn receive_framing_delivers_messages_in_order() {
        let ctx = Context::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.push_recv_chunk(vec![5, 1, 2, 3, 4, 5, 4, 1, 2, 3, 4]);
        let mt = MessageTransport::new(ctx.clone(), Arc::clone(&transport), 4096, 64, Some(Duration::from_secs(5)));
        mt.start();

        let first = Arc::new(Mutex::new(None));
        let f = Arc::clone(&first);
        mt.recv_async(vec![0u8; 5], move |_, outcome| *f.lock() = Some(outcome));
        assert!(drive_until(&ctx, || first.lock().is_some(), Duration::from_secs(2)));
        match first.lock().take().unwrap() {
            RecvOutcome::Delivered { buf, size } => {
                assert_eq!(size, 5);
                assert_eq!(buf, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("expected Delivered, got {other:?}"),
        }

        let second = Arc::new(Mutex::new(None));
        let s = Arc::clone(&second);
        mt.recv_async(vec![0u8; 4], move |_, outcome| *s.lock() = Some(outcome));
        assert!(drive_until(&ctx, || second.lock().is_some(), Duration::from_secs(2)));
        match second.lock().take().unwrap() {
            RecvOutcome::Delivered { buf, size } => {
                assert_eq!(size, 4);
                assert_eq!(buf, vec![1, 2, 3, 4]);
            }
            other => panic!("expected Delivered, got {other:?}"),
        }
    }

    #[test]
    fn receive_into_undersized_buffer_reports_buffer_too_small() {
        let ctx = Context::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.push_recv_chunk(vec![5, 1, 2, 3, 4, 5]);
        let mt = MessageTransport::new(ctx.clone(), Arc::clone(&transport), 4096, 64, Some(Duration::from_secs(5)));
        mt.start();

        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        mt.recv_async(vec![0u8; 3], move |_, outcome| *r.lock() = Some(outcome));
        assert!(drive_until(&ctx, || result.lock().is_some(), Duration::from_secs(2)));
        match result.lock().take().unwrap() {
            RecvOutcome::BufferTooSmall { buf, size } => {
                assert_eq!(size, 5);
                assert_eq!(buf, vec![1, 2, 3]);
            }
            other => panic!("expected BufferTooSmall, got {other:?}"),
        }
    }

    #[test]
    fn size_field_overflow_is_fatal_and_sticky() {
        let ctx = Context::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.push_recv_chunk(vec![0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);
        let mt = MessageTransport::new(ctx.clone(), Arc::clone(&transport), 4096, 64, Some(Duration::from_secs(5)));
        mt.start();

        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        mt.recv_async(vec![0u8; 8], move |_, outcome| *r.lock() = Some(outcome));
        assert!(drive_until(&ctx, || result.lock().is_some(), Duration::from_secs(2)));
        match result.lock().take().unwrap() {
            RecvOutcome::Failed { error, .. } => assert_eq!(error, YogiErrorCode::DeserializeMsgFailed),
            other => panic!("expected Failed, got {other:?}"),
        }

        let second = Arc::new(Mutex::new(None));
        let s = Arc::clone(&second);
        mt.recv_async(vec![0u8; 4], move |_, outcome| *s.lock() = Some(outcome));
        assert!(drive_until(&ctx, || second.lock().is_some(), Duration::from_secs(2)));
        match second.lock().take().unwrap() {
            RecvOutcome::Failed { error, .. } => assert_eq!(error, YogiErrorCode::DeserializeMsgFailed),
            other => panic!("expected sticky Failed, got {other:?}"),
        }
    }

    #[test]
    fn cancel_send_before_reaching_wire_invokes_canceled_once() {
        let ctx = Context::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.block_sends();
        let mt = MessageTransport::new(ctx.clone(), Arc::clone(&transport), 16, 4096, Some(Duration::from_secs(5)));
        mt.start();

        // Fill the tx ring completely so the next send_async cannot take
        // the fast path and must sit in pending_sends.
        assert!(mt.try_send(&[0u8; 15]).unwrap());

        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        mt.send_async(b"cancel-me", 7, move |_, status| *r.lock() = Some(status));

        assert!(mt.cancel_send(7));
        assert!(!mt.cancel_send(7));
        assert!(drive_until(&ctx, || result.lock().is_some(), Duration::from_secs(2)));
        assert_eq!(*result.lock(), Some(Err(YogiErrorCode::Canceled)));

        transport.unblock_sends();
    }

    #[test]
    fn sends_drain_to_the_wire_in_submission_order() {
        let ctx = Context::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        transport.block_sends();
        let mt = MessageTransport::new(ctx.clone(), Arc::clone(&transport), 20, 4096, Some(Duration::from_secs(5)));
        mt.start();

        let frame = |payload: &[u8]| {
            let mut f = varint::encode(payload.len() as u64).unwrap();
            f.extend_from_slice(payload);
            f
        };
        let messages: Vec<&[u8]> = vec![b"one", b"two", b"3333", b"four!"];
        let mut expected = Vec::new();
        for m in &messages {
            expected.extend_from_slice(&frame(m));
        }

        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for m in &messages {
            let d = Arc::clone(&done);
            mt.send_async(m, 0, move |_, status| {
                assert!(status.is_ok());
                d.fetch_add(1, Ordering::SeqCst);
            });
        }

        transport.unblock_sends();
        assert!(drive_until(
            &ctx,
            || done.load(Ordering::SeqCst) == messages.len(),
            Duration::from_secs(2)
        ));
        assert_eq!(transport.sent_bytes(), expected);
    }
}
