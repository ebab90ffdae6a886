//! The out-of-process half of the binding (§4.E): embeds the real module and
//! speaks the wire protocol to a Proxy.
//!
//! Where the Proxy is driven by the broker calling into it, the Host is
//! driven by whatever event loop the embedding process runs — either by
//! calling `do_work` directly, or via the `start_worker_thread` convenience,
//! splitting library logic from a thread-owning entry point the same way a
//! process-entry binary embeds a single-step API.

use crate::error::{HostAttachError, TransportError};
use crate::transport::PairSocket;
use crate::wire::ControlFrame;
use crate::GATEWAY_MESSAGE_VERSION;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Upper bound on a connection id's length (§6 `attach` — "non-null and
/// bounded").
pub const MAX_CONNECTION_ID_LEN: usize = 256;

/// The real module's lifecycle, bound at `attach` time (§9 — "Global vtable
/// struct exported as module API → a `ModuleVTable` trait object").
///
/// `create`, `receive` and `destroy` are required; `start` and the
/// configuration callbacks default to no-ops, matching the "at least
/// create/destroy/receive" completeness bar — the Rust type system enforces
/// it structurally, so an `attach` call can only fail vtable validation by
/// receiving no module at all (see `HostAttachError::IncompleteVtable`).
pub trait Module: Send {
    /// Parses opaque module arguments carried in `ModuleCreate` into
    /// whatever configuration shape the module wants. Returning `None` is
    /// valid — not every module needs configuration.
    fn parse_configuration(&self, _args: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Releases a configuration object. No-op by default.
    fn free_configuration(&self, _config: Option<Vec<u8>>) {}

    /// Instantiates the module. `Ok(())` replies `ModuleReply{status: 0}`;
    /// `Err(status)` replies with that (non-zero) status.
    fn create(&self, config: Option<Vec<u8>>) -> Result<(), i32>;

    /// Called once all three Proxy worker threads are confirmed running.
    fn start(&self) {}

    /// Delivers one message received on the data channel.
    fn receive(&self, message: Box<[u8]>);

    /// Tears the module down. Always called during `detach`, regardless of
    /// whether `create` ever succeeded.
    fn destroy(&self);
}

/// Typed configuration for `attach` (mirrors `ProxyConfig`'s role on the
/// Proxy side).
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub control_url: String,
    pub message_url: String,
    pub connection_id: String,
    /// Bounds how long `attach` blocks waiting for the Proxy to connect the
    /// control socket. `None` blocks indefinitely.
    pub accept_timeout: Option<Duration>,
}

struct State {
    /// The message socket connected to the Proxy. Established eagerly by
    /// `attach` (mirroring the Proxy's own eager connect of both sockets
    /// during `create`) and only ever torn down and reopened on a reattach —
    /// a second `ModuleCreate` arriving after the first one has already
    /// succeeded.
    message_socket: Option<Arc<PairSocket>>,
    /// `true` once the first `ModuleCreate` has been processed successfully.
    /// Distinguishes the initial connection (already established by
    /// `attach`, nothing further to do) from a reattach (the old connection
    /// is stale and must be closed and re-accepted on the URI carried in the
    /// fresh frame).
    has_created: bool,
    /// Set when a reattach needs a fresh message-socket connection; cleared
    /// once `poll_message_accept` lands one. Kept separate from
    /// `message_socket` so accepting the Proxy's reconnect can be retried
    /// across several `do_work` calls instead of blocking the one that
    /// handles the Create reply.
    pending_message_uri: Option<String>,
    module: Box<dyn Module>,
}

/// Bounds `bind_and_accept` on the message socket so it never blocks
/// `do_work` indefinitely (§6: `do_work` is "one non-blocking control poll
/// plus one non-blocking data poll"). Reusing `HostConfig::accept_timeout`
/// verbatim would let a caller's `None` (block forever, fine for the
/// one-shot `attach` call) leak into a path that runs on every `do_work`
/// call, so this is capped independently of that setting.
const MESSAGE_ACCEPT_TIMEOUT: Duration = Duration::from_millis(50);

struct WorkerSlot {
    stop: Mutex<bool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerSlot {
    fn new() -> Self {
        WorkerSlot {
            stop: Mutex::new(false),
            handle: Mutex::new(None),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.lock().unwrap()
    }
}

/// The Host's handle (§3 — mirror of `ProxyHandle` on the remote side).
pub struct HostHandle {
    control_socket: Arc<PairSocket>,
    connection_id: String,
    state: Mutex<State>,
    worker: WorkerSlot,
}

/// Validates the module and connection id, then binds both the control and
/// message sockets in the reply role and blocks for a connecting Proxy (§6
/// `attach`). Binding the message socket here, rather than waiting for the
/// first `ModuleCreate`, mirrors the Proxy connecting both sockets eagerly
/// during `create` (§4.D step 4) — the Proxy's message-socket connect
/// otherwise has nothing listening on the other end until the Create
/// handshake it is itself blocking completes.
pub fn attach(
    module: Option<Box<dyn Module>>,
    config: HostConfig,
) -> Result<Arc<HostHandle>, HostAttachError> {
    let module = module.ok_or(HostAttachError::IncompleteVtable)?;
    if config.connection_id.is_empty() || config.connection_id.len() > MAX_CONNECTION_ID_LEN {
        return Err(HostAttachError::InvalidConnectionId {
            max: MAX_CONNECTION_ID_LEN,
        });
    }

    let control_socket = PairSocket::bind_and_accept(&config.control_url, config.accept_timeout)?;
    let message_socket = PairSocket::bind_and_accept(&config.message_url, config.accept_timeout)?;

    Ok(Arc::new(HostHandle {
        control_socket: Arc::new(control_socket),
        connection_id: config.connection_id,
        state: Mutex::new(State {
            message_socket: Some(Arc::new(message_socket)),
            has_created: false,
            pending_message_uri: None,
            module,
        }),
        worker: WorkerSlot::new(),
    }))
}

/// Returns the connection id this handle was attached with.
pub fn connection_id(handle: &HostHandle) -> &str {
    &handle.connection_id
}

/// Halts the worker thread if running, destroys the module and closes both
/// sockets (§6 `detach`).
pub fn detach(handle: Option<Arc<HostHandle>>) {
    let Some(handle) = handle else { return };
    halt_worker_thread(Some(&handle));

    let mut state = handle.state.lock().unwrap();
    state.module.destroy();
    if let Some(socket) = state.message_socket.take() {
        socket.close();
    }
    handle.control_socket.close();
}

/// Services one non-blocking control poll, one bounded message-socket accept
/// attempt, and one non-blocking data poll (§6 `do_work`), suitable for a
/// caller-owned event loop.
pub fn do_work(handle: Option<&Arc<HostHandle>>) {
    let Some(handle) = handle else { return };
    poll_control(handle);
    poll_message_accept(handle);
    poll_data(handle);
}

fn poll_control(handle: &Arc<HostHandle>) {
    match handle.control_socket.recv(true) {
        Ok(bytes) => match ControlFrame::decode(&bytes) {
            Ok(frame) => handle_control_frame(handle, frame),
            Err(e) => crate::logging::log_warn(&format!("dropping malformed control frame: {e}")),
        },
        Err(TransportError::WouldBlock) | Err(TransportError::TimedOut) => {}
        Err(e) => crate::logging::log_warn(&format!("control channel recv error: {e}")),
    }
}

fn handle_control_frame(handle: &Arc<HostHandle>, frame: ControlFrame) {
    match frame {
        ControlFrame::ModuleCreate {
            gateway_message_version,
            message_uri,
            module_args,
        } => handle_module_create(handle, gateway_message_version, &message_uri, &module_args),
        ControlFrame::ModuleStart => {
            let state = handle.state.lock().unwrap();
            state.module.start();
        }
        ControlFrame::ModuleDestroy => {
            let mut state = handle.state.lock().unwrap();
            state.module.destroy();
            state.pending_message_uri = None;
            if let Some(socket) = state.message_socket.take() {
                socket.close();
            }
        }
        ControlFrame::ModuleReply { .. } => {
            // The Host never issues a request this would correlate to.
            crate::logging::log_warn("ignoring unexpected ModuleReply on the host side");
        }
    }
}

fn handle_module_create(
    handle: &Arc<HostHandle>,
    gateway_message_version: u8,
    message_uri: &str,
    module_args: &[u8],
) {
    let status = if gateway_message_version != GATEWAY_MESSAGE_VERSION {
        crate::logging::log_error(&format!(
            "rejecting ModuleCreate: unsupported gateway message version {gateway_message_version}"
        ));
        -1
    } else {
        let mut state = handle.state.lock().unwrap();
        let config = state.module.parse_configuration(module_args);
        let result = state.module.create(config.clone());
        state.module.free_configuration(config);
        match result {
            Ok(()) => 0,
            Err(status) => status,
        }
    };

    let reply = ControlFrame::ModuleReply { status }.to_bytes();
    if let Err(e) = handle.control_socket.send(&reply, false) {
        crate::logging::log_warn(&format!("failed to send ModuleReply: {e}"));
        return;
    }

    if status == 0 {
        let mut state = handle.state.lock().unwrap();
        if state.has_created {
            // A second successful ModuleCreate means the Proxy's supervisor
            // detected a failure and re-ran the handshake. The message
            // connection from the previous session is stale — the Proxy has
            // already reconnected on its side — so close it and wait to
            // accept the fresh one on the URI this frame carries.
            if let Some(old) = state.message_socket.take() {
                old.close();
            }
            state.pending_message_uri = Some(message_uri.to_string());
        }
        state.has_created = true;
    }
}

/// Attempts to accept the Proxy's message-socket connection, bounded by
/// `MESSAGE_ACCEPT_TIMEOUT` so `do_work` always returns promptly. Retried on
/// every `do_work` call for as long as `pending_message_uri` is set and no
/// socket has landed yet.
fn poll_message_accept(handle: &Arc<HostHandle>) {
    let pending = {
        let state = handle.state.lock().unwrap();
        if state.message_socket.is_some() {
            return;
        }
        state.pending_message_uri.clone()
    };
    let Some(message_uri) = pending else { return };

    match PairSocket::bind_and_accept(&message_uri, Some(MESSAGE_ACCEPT_TIMEOUT)) {
        Ok(socket) => {
            let mut state = handle.state.lock().unwrap();
            state.message_socket = Some(Arc::new(socket));
        }
        Err(TransportError::TimedOut) => {}
        Err(e) => crate::logging::log_warn(&format!(
            "message socket accept attempt failed, will retry: {e}"
        )),
    }
}

fn poll_data(handle: &Arc<HostHandle>) {
    let socket = { handle.state.lock().unwrap().message_socket.clone() };
    let Some(socket) = socket else { return };

    match socket.recv(true) {
        Ok(bytes) => {
            let state = handle.state.lock().unwrap();
            state.module.receive(bytes.into_boxed_slice());
        }
        Err(TransportError::WouldBlock) | Err(TransportError::TimedOut) => {}
        Err(e) => crate::logging::log_warn(&format!("message channel recv error: {e}")),
    }
}

/// Sends a message from the module out to the Proxy. The spec's "outbound
/// path lets the module push messages out via serialize+send" (§4.E) is
/// exposed here rather than through the `Module` trait, since the module
/// implementation is the one holding the `HostHandle` to call it with.
pub fn send(handle: &HostHandle, bytes: &[u8]) -> Result<(), TransportError> {
    let socket = { handle.state.lock().unwrap().message_socket.clone() };
    match socket {
        Some(socket) => socket.send(bytes, true).map(|_| ()),
        None => Err(TransportError::WouldBlock),
    }
}

/// Spawns a thread that calls `do_work` in a loop until
/// `halt_worker_thread` is called (§6 `start_worker_thread`).
pub fn start_worker_thread(handle: Option<&Arc<HostHandle>>) {
    let Some(handle) = handle else { return };
    let mut existing = handle.worker.handle.lock().unwrap();
    if existing.is_some() {
        crate::logging::log_warn("worker thread already running; ignoring start request");
        return;
    }
    *handle.worker.stop.lock().unwrap() = false;

    let thread_handle = handle.clone();
    match thread::Builder::new()
        .name("modbridge-host-worker".into())
        .spawn(move || {
            while !thread_handle.worker.is_stopped() {
                do_work(Some(&thread_handle));
                thread::sleep(Duration::from_millis(1));
            }
        }) {
        Ok(join) => *existing = Some(join),
        Err(e) => crate::logging::log_error(&format!("failed to spawn host worker thread: {e}")),
    }
}

/// Stops and joins the worker thread started by `start_worker_thread`, if
/// any (§6 `halt_worker_thread`).
pub fn halt_worker_thread(handle: Option<&Arc<HostHandle>>) {
    let Some(handle) = handle else { return };
    *handle.worker.stop.lock().unwrap() = true;
    let join = handle.worker.handle.lock().unwrap().take();
    if let Some(join) = join {
        let _ = join.join();
    }
}
