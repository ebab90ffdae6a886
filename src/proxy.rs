//! The in-process half of the binding (§4.D): presents the module contract
//! to the broker while forwarding to a remote Host process.
//!
//! A background thread owns the connection and a small, lock-guarded handle
//! is shared with callers, generalized to four cooperating threads per the
//! binding's own concurrency model.

use crate::broker::{Broker, GatewayMessage};
use crate::error::{ProxyCreateError, TransportError};
use crate::queue::MessageQueue;
use crate::transport::PairSocket;
use crate::wire::ControlFrame;
use crate::GATEWAY_MESSAGE_VERSION;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How `ProxyHandle::create` returns control to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMode {
    /// `create` blocks until the Create handshake finishes (or fails).
    Sync,
    /// `create` returns immediately; the handshake runs on the async-creator
    /// thread and failure only manifests later as dropped messages (§7).
    Async,
}

/// Typed configuration consumed once by `create` (§3 `ProxyConfig`).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub control_url: String,
    pub message_url: String,
    pub module_args: Vec<u8>,
    pub lifecycle_mode: LifecycleMode,
    pub default_wait_ms: u64,
}

/// Total attempts for the best-effort Destroy send: one initial attempt plus
/// ten retries (§4.D step 2, §9 open question — kept as specified).
const DESTROY_SEND_ATTEMPTS: u32 = 11;

/// Bounded retry budget for a single Create handshake attempt sequence
/// (async-creator and supervisor reattach both use this). Chosen so a
/// 100ms `default_wait_ms` peer that accepts on its third attempt
/// completes within the ~300ms window described in §8's boundary
/// behaviors.
const CREATE_HANDSHAKE_MAX_ROUNDS: u32 = 8;

const DATA_THREAD_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Bounds the receiver thread's blocking `recv` on the message socket so it
/// periodically re-reads the socket handle from `handle_lock` per invariant
/// #3, instead of blocking forever on a connection a reattach has since
/// replaced.
const MESSAGE_RECV_TIMEOUT: Duration = Duration::from_millis(250);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct ThreadSlotState {
    stop: bool,
    handle: Option<thread::JoinHandle<()>>,
}

/// `{lock, handle, stop_flag}` from §3 — one per worker thread. Never
/// acquired while `ProxyHandle::handle_lock` is held (invariant #1).
struct ThreadSlot {
    state: Mutex<ThreadSlotState>,
}

impl ThreadSlot {
    fn new() -> Self {
        ThreadSlot {
            state: Mutex::new(ThreadSlotState::default()),
        }
    }

    fn set_handle(&self, handle: thread::JoinHandle<()>) {
        self.state.lock().unwrap().handle = Some(handle);
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stop
    }

    fn signal_stop(&self) {
        self.state.lock().unwrap().stop = true;
    }

    fn join_and_clear(&self) {
        let handle = self.state.lock().unwrap().handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct Inner {
    message_socket: Option<Arc<PairSocket>>,
    control_socket: Option<Arc<PairSocket>>,
    outgoing_queue: MessageQueue,
    control_url: String,
    message_url: String,
    module_args: Vec<u8>,
}

/// The Proxy's handle (§3 `ProxyHandle`). Shared via `Arc` across its four
/// worker threads and the broker that owns it.
pub struct ProxyHandle {
    handle_lock: Mutex<Inner>,
    broker: Arc<dyn Broker>,
    handle_id: u64,
    default_wait_ms: u64,
    receiver_slot: ThreadSlot,
    sender_slot: ThreadSlot,
    supervisor_slot: ThreadSlot,
    creator_slot: ThreadSlot,
    needs_reattach: AtomicBool,
    started: AtomicBool,
}

/// Clones the input, or returns `None` for a `None` input (§4.D
/// `parse_configuration` — this crate does not parse structure, it only
/// owns the typed shape a real parser would produce).
pub fn parse_configuration(text: Option<&str>) -> Option<String> {
    text.map(|s| s.to_string())
}

/// No-op on `None`; otherwise drops the owned string (§4.D
/// `free_configuration`).
pub fn free_configuration(_config: Option<String>) {}

/// Creates a Proxy handle, connecting both sockets and kicking off the
/// Create handshake (§4.D `create`). Returns `None` on any failure — the
/// only failure the broker observes at creation time in sync mode (§7).
pub fn create(broker: Option<Arc<dyn Broker>>, config: Option<ProxyConfig>) -> Option<Arc<ProxyHandle>> {
    match try_create(broker, config) {
        Ok(handle) => Some(handle),
        Err(e) => {
            crate::logging::log_error(&format!("proxy create failed: {e}"));
            None
        }
    }
}

fn try_create(
    broker: Option<Arc<dyn Broker>>,
    config: Option<ProxyConfig>,
) -> Result<Arc<ProxyHandle>, ProxyCreateError> {
    let broker = broker.ok_or(ProxyCreateError::MissingBroker)?;
    let config = config.ok_or(ProxyCreateError::MissingConfig)?;

    // Connection setup (§4.D step 4): both sockets connect eagerly, before
    // the Create handshake ever runs. Connecting the message socket up
    // front — rather than deferring it until after the handshake succeeds —
    // means a message queued via `receive` before the handshake finishes
    // still has somewhere to go once the sender thread drains it, instead
    // of being silently dropped for the lifetime of the handshake.
    let control_socket = PairSocket::connect(&config.control_url)?;
    let message_socket = PairSocket::connect(&config.message_url)?;
    message_socket.set_recv_timeout(Some(MESSAGE_RECV_TIMEOUT))?;

    let handle = Arc::new(ProxyHandle {
        handle_lock: Mutex::new(Inner {
            message_socket: Some(Arc::new(message_socket)),
            control_socket: Some(Arc::new(control_socket)),
            outgoing_queue: MessageQueue::new(),
            control_url: config.control_url.clone(),
            message_url: config.message_url.clone(),
            module_args: config.module_args.clone(),
        }),
        broker,
        handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        default_wait_ms: config.default_wait_ms,
        receiver_slot: ThreadSlot::new(),
        sender_slot: ThreadSlot::new(),
        supervisor_slot: ThreadSlot::new(),
        creator_slot: ThreadSlot::new(),
        needs_reattach: AtomicBool::new(false),
        started: AtomicBool::new(false),
    });

    let (result_tx, result_rx) = mpsc::channel();
    spawn_creator_thread(&handle, result_tx)?;

    match config.lifecycle_mode {
        LifecycleMode::Async => Ok(handle),
        LifecycleMode::Sync => {
            handle.creator_slot.join_and_clear();
            match result_rx.recv() {
                Ok(true) => Ok(handle),
                _ => {
                    close_sockets(&handle);
                    Err(ProxyCreateError::HandshakeFailed)
                }
            }
        }
    }
}

fn close_sockets(handle: &ProxyHandle) {
    let mut inner = handle.handle_lock.lock().unwrap();
    if let Some(socket) = inner.control_socket.take() {
        socket.close();
    }
    if let Some(socket) = inner.message_socket.take() {
        socket.close();
    }
}

/// Spawns the receiver, sender and supervisor threads, then sends
/// `ModuleStart` on the control channel (§4.D `start`). A second call is
/// rejected — this binding does not double-spawn threads (§8 idempotence).
pub fn start(handle: Option<&Arc<ProxyHandle>>) {
    let Some(handle) = handle else { return };
    if handle.started.swap(true, Ordering::AcqRel) {
        crate::logging::log_warn("start called again on an already-started handle; ignoring");
        return;
    }

    spawn_receiver_thread(handle);
    spawn_sender_thread(handle);
    spawn_supervisor_thread(handle);

    let control_socket = { handle.handle_lock.lock().unwrap().control_socket.clone() };
    if let Some(control_socket) = control_socket {
        let frame = ControlFrame::ModuleStart.to_bytes();
        if let Err(e) = control_socket.send(&frame, false) {
            crate::logging::log_warn(&format!("failed to send ModuleStart: {e}"));
        }
    }
}

/// Queues `message` for delivery to the remote module (§4.D `receive`).
/// `message` is cloned so the caller keeps its own copy; wire encoding
/// happens later, on the sender thread, right before the bytes leave the
/// process.
pub fn receive(handle: Option<&Arc<ProxyHandle>>, message: Option<&dyn GatewayMessage>) {
    let (Some(handle), Some(message)) = (handle, message) else {
        return;
    };
    let cloned = message.clone_boxed();
    let mut inner = handle.handle_lock.lock().unwrap();
    inner.outgoing_queue.push(cloned);
}

/// Tears the handle down (§4.D `destroy`): best-effort Destroy send, socket
/// close, stop-and-join every worker thread, drop any undelivered messages.
/// Calling this a second time on an already-destroyed handle is a no-op.
pub fn destroy(handle: Option<Arc<ProxyHandle>>) {
    let Some(handle) = handle else { return };

    let control_socket = { handle.handle_lock.lock().unwrap().control_socket.clone() };
    if let Some(control_socket) = control_socket {
        let frame = ControlFrame::ModuleDestroy.to_bytes();
        let mut sent = false;
        for _ in 0..DESTROY_SEND_ATTEMPTS {
            match control_socket.send(&frame, true) {
                Ok(_) => {
                    sent = true;
                    break;
                }
                Err(TransportError::WouldBlock) => continue,
                Err(_) => break,
            }
        }
        if !sent {
            crate::logging::log_warn("best-effort Destroy send did not succeed");
        }
    }

    close_sockets(&handle);

    for slot in [
        &handle.receiver_slot,
        &handle.sender_slot,
        &handle.supervisor_slot,
        &handle.creator_slot,
    ] {
        slot.signal_stop();
        slot.join_and_clear();
    }

    handle.handle_lock.lock().unwrap().outgoing_queue.clear();
}

fn spawn_creator_thread(
    handle: &Arc<ProxyHandle>,
    result_tx: mpsc::Sender<bool>,
) -> Result<(), ProxyCreateError> {
    let thread_handle = handle.clone();
    let join = thread::Builder::new()
        .name("modbridge-proxy-creator".into())
        .spawn(move || creator_loop(thread_handle, result_tx))
        .map_err(ProxyCreateError::Spawn)?;
    handle.creator_slot.set_handle(join);
    Ok(())
}

fn creator_loop(handle: Arc<ProxyHandle>, result_tx: mpsc::Sender<bool>) {
    let snapshot = {
        let inner = handle.handle_lock.lock().unwrap();
        inner.control_socket.clone().map(|socket| {
            (
                socket,
                inner.message_url.clone(),
                inner.module_args.clone(),
            )
        })
    };

    let outcome = match snapshot {
        Some((control_socket, message_url, module_args)) => run_create_handshake(
            &control_socket,
            &message_url,
            &module_args,
            handle.default_wait_ms,
            &handle.creator_slot,
        )
        .is_ok(),
        None => false,
    };

    let _ = result_tx.send(outcome);
}

/// Reconnects the message socket on a supervisor reattach and installs it on
/// the handle, replacing (and explicitly closing) the stale one. Logs and
/// returns `false` on failure. Not used for the initial connection — that
/// one is made eagerly in `try_create`, alongside the control socket.
///
/// Closing the old socket here — rather than just dropping the `Option` —
/// matters because the receiver thread usually holds its own `Arc` clone of
/// the old socket parked in a blocking `recv`, so overwriting the handle's
/// `Option` alone would not drop the last reference and the receiver would
/// never notice the reattach. An explicit `close()` unblocks it immediately
/// instead of waiting out `MESSAGE_RECV_TIMEOUT`.
fn connect_message_socket(handle: &Arc<ProxyHandle>, message_url: &str) -> bool {
    match PairSocket::connect(message_url) {
        Ok(socket) => {
            if let Err(e) = socket.set_recv_timeout(Some(MESSAGE_RECV_TIMEOUT)) {
                crate::logging::log_error(&format!("failed to set message socket timeout: {e}"));
                return false;
            }
            let old = {
                let mut inner = handle.handle_lock.lock().unwrap();
                inner.message_socket.replace(Arc::new(socket))
            };
            if let Some(old) = old {
                old.close();
            }
            true
        }
        Err(e) => {
            crate::logging::log_error(&format!("failed to connect message socket: {e}"));
            false
        }
    }
}

/// The Create handshake (§4.D async-creator thread), reused verbatim by the
/// supervisor on reattach (§9 — "handshake retry loop inlined twice").
fn run_create_handshake(
    control_socket: &PairSocket,
    message_url: &str,
    module_args: &[u8],
    default_wait_ms: u64,
    owning_slot: &ThreadSlot,
) -> Result<(), ()> {
    let frame = ControlFrame::ModuleCreate {
        gateway_message_version: GATEWAY_MESSAGE_VERSION,
        message_uri: message_url.to_string(),
        module_args: module_args.to_vec(),
    };
    let bytes = frame.to_bytes();

    control_socket
        .set_recv_timeout(Some(Duration::from_millis(default_wait_ms)))
        .map_err(|_| ())?;

    for _ in 0..CREATE_HANDSHAKE_MAX_ROUNDS {
        if owning_slot.is_stopped() {
            return Err(());
        }
        match control_socket.send(&bytes, true) {
            Ok(_) => {}
            Err(TransportError::WouldBlock) => {
                thread::sleep(Duration::from_millis(default_wait_ms));
                continue;
            }
            Err(_) => return Err(()),
        }

        loop {
            if owning_slot.is_stopped() {
                return Err(());
            }
            match control_socket.recv(false) {
                Ok(bytes) => {
                    return match ControlFrame::decode(&bytes) {
                        Ok(ControlFrame::ModuleReply { status: 0 }) => Ok(()),
                        _ => Err(()),
                    };
                }
                Err(TransportError::WouldBlock) | Err(TransportError::TimedOut) => break,
                Err(_) => return Err(()),
            }
        }
    }
    Err(())
}

fn spawn_receiver_thread(handle: &Arc<ProxyHandle>) {
    let thread_handle = handle.clone();
    match thread::Builder::new()
        .name("modbridge-proxy-receiver".into())
        .spawn(move || receiver_loop(thread_handle))
    {
        Ok(join) => handle.receiver_slot.set_handle(join),
        Err(e) => crate::logging::log_error(&format!("failed to spawn receiver thread: {e}")),
    }
}

fn receiver_loop(handle: Arc<ProxyHandle>) {
    loop {
        if handle.receiver_slot.is_stopped() {
            return;
        }
        let socket = { handle.handle_lock.lock().unwrap().message_socket.clone() };
        let Some(socket) = socket else { return };

        match socket.recv(false) {
            Ok(bytes) => {
                handle
                    .broker
                    .publish(handle.handle_id, bytes.into_boxed_slice());
            }
            Err(TransportError::TimedOut) | Err(TransportError::WouldBlock) => {}
            Err(e) => {
                // A receive error doesn't mean the handle itself is gone —
                // the remote module can crash and come back, and the
                // supervisor will reattach and install a fresh socket here
                // (`connect_message_socket` replaces and closes the stale
                // one). This thread only exits via `stop_flag`, the same as
                // the sender thread, so it keeps polling and picks up the
                // new socket once reattach completes instead of exiting for
                // good on the first error from a dead peer.
                let still_current = handle
                    .handle_lock
                    .lock()
                    .unwrap()
                    .message_socket
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &socket));
                if still_current {
                    crate::logging::log_warn(&format!("message socket error, awaiting reattach: {e}"));
                } else {
                    crate::logging::log_info("message socket replaced by reattach; resuming on new socket");
                }
            }
        }
        thread::sleep(DATA_THREAD_POLL_INTERVAL);
    }
}

fn spawn_sender_thread(handle: &Arc<ProxyHandle>) {
    let thread_handle = handle.clone();
    match thread::Builder::new()
        .name("modbridge-proxy-sender".into())
        .spawn(move || sender_loop(thread_handle))
    {
        Ok(join) => handle.sender_slot.set_handle(join),
        Err(e) => crate::logging::log_error(&format!("failed to spawn sender thread: {e}")),
    }
}

fn sender_loop(handle: Arc<ProxyHandle>) {
    loop {
        if handle.sender_slot.is_stopped() {
            return;
        }
        let (msg, socket) = {
            let mut inner = handle.handle_lock.lock().unwrap();
            let msg = inner.outgoing_queue.pop();
            (msg, inner.message_socket.clone())
        };

        if let Some(msg) = msg {
            let bytes = msg.serialize();
            if let Some(socket) = socket {
                if let Err(e) = socket.send(&bytes, true) {
                    crate::logging::log_warn(&format!("dropping outgoing message: {e}"));
                }
            }
            // `msg` is dropped here whether or not the send succeeded.
        }
        thread::sleep(DATA_THREAD_POLL_INTERVAL);
    }
}

fn spawn_supervisor_thread(handle: &Arc<ProxyHandle>) {
    let thread_handle = handle.clone();
    match thread::Builder::new()
        .name("modbridge-proxy-supervisor".into())
        .spawn(move || supervisor_loop(thread_handle))
    {
        Ok(join) => handle.supervisor_slot.set_handle(join),
        Err(e) => crate::logging::log_error(&format!("failed to spawn supervisor thread: {e}")),
    }
}

fn supervisor_loop(handle: Arc<ProxyHandle>) {
    loop {
        if handle.supervisor_slot.is_stopped() {
            return;
        }

        if handle.needs_reattach.load(Ordering::Acquire) {
            match run_reattach(&handle) {
                Ok(()) => handle.needs_reattach.store(false, Ordering::Release),
                Err(()) => crate::logging::log_warn("reattach handshake failed, will retry"),
            }
        }

        let control_socket = { handle.handle_lock.lock().unwrap().control_socket.clone() };
        let Some(control_socket) = control_socket else {
            return;
        };

        match control_socket.recv(true) {
            Ok(bytes) => {
                if let Ok(ControlFrame::ModuleReply { status }) = ControlFrame::decode(&bytes) {
                    if status != 0 {
                        crate::logging::log_warn("peer reported failure; marking for reattach");
                        handle.needs_reattach.store(true, Ordering::Release);
                    }
                }
            }
            Err(TransportError::WouldBlock) => {}
            Err(e) => {
                crate::logging::log_warn(&format!("supervisor exiting: {e}"));
                return;
            }
        }

        thread::sleep(SUPERVISOR_POLL_INTERVAL);
    }
}

fn run_reattach(handle: &Arc<ProxyHandle>) -> Result<(), ()> {
    let snapshot = {
        let inner = handle.handle_lock.lock().unwrap();
        inner.control_socket.clone().map(|socket| {
            (
                socket,
                inner.message_url.clone(),
                inner.module_args.clone(),
            )
        })
    };
    let Some((control_socket, message_url, module_args)) = snapshot else {
        return Err(());
    };

    run_create_handshake(
        &control_socket,
        &message_url,
        &module_args,
        handle.default_wait_ms,
        &handle.supervisor_slot,
    )?;

    if !connect_message_socket(handle, &message_url) {
        return Err(());
    }

    let frame = ControlFrame::ModuleStart.to_bytes();
    control_socket.send(&frame, false).map_err(|_| ())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LoopbackBroker;

    #[test]
    fn parse_and_free_configuration_roundtrip_none() {
        assert_eq!(parse_configuration(None), None);
        free_configuration(None);
    }

    #[test]
    fn parse_configuration_clones_input() {
        let parsed = parse_configuration(Some("hello")).unwrap();
        assert_eq!(parsed, "hello");
    }

    #[test]
    fn create_rejects_missing_broker_or_config() {
        let config = ProxyConfig {
            control_url: "/tmp/does-not-matter".into(),
            message_url: "/tmp/does-not-matter-either".into(),
            module_args: Vec::new(),
            lifecycle_mode: LifecycleMode::Async,
            default_wait_ms: 50,
        };
        assert!(create(None, Some(config.clone())).is_none());
        let broker: Arc<dyn Broker> = Arc::new(LoopbackBroker::new());
        assert!(create(Some(broker), None).is_none());
    }

    #[test]
    fn destroy_on_none_is_a_no_op() {
        destroy(None);
    }

    #[test]
    fn receive_with_missing_handle_or_message_is_a_no_op() {
        // exercised through the public signature: both None arms return early
        receive(None, None);
    }
}
