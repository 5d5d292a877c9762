//! Purpose: One addressable pipe endpoint: publish/unpublish lifecycle,
//! send/set/request operations, and inbound envelope interception.
//! Exports: `Pipe`, `PipeConfig`, `ChangeEvent`.
//! Role: The core pub/sub endpoint every higher construct builds on.
//! Invariants: At most one request is in flight per instance; a second
//! concurrent request fails with `Busy`.
//! Invariants: A request forces a transient published state through a scoped
//! guard that restores prior state on every exit path, error paths included.
//! Invariants: An inbound request envelope goes to the waiting caller when
//! `awaiting_reply` is set on this exact instance, otherwise to the
//! application responder, never both.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::core::envelope::{Address, DEFAULT_CHANNEL, Envelope};
use crate::core::error::{Error, ErrorKind};
use crate::core::sweep;
use crate::core::transport::{Transport, default_root};
use crate::core::watch::DirWatcher;

/// Tuning for one pipe (and, through `Group`, for every member it creates).
#[derive(Clone, Debug)]
pub struct PipeConfig {
    /// Shared root directory; `None` resolves `FILEPIPE_DIR` or the
    /// host-local default.
    pub root: Option<PathBuf>,
    /// Deadline for `request`; a lost reply fails with `Timeout` instead of
    /// hanging forever.
    pub request_timeout: Duration,
    /// Directory scan interval of the watch.
    pub poll_interval: Duration,
    /// Message file lifetime enforced by the retention sweeper.
    pub retention: Duration,
}

impl PipeConfig {
    pub fn new() -> Self {
        Self {
            root: None,
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            retention: sweep::DEFAULT_RETENTION,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Fired once per accepted non-request envelope, including ones the pipe
/// broadcast itself via `send`.
#[derive(Clone, Debug)]
pub struct ChangeEvent<T> {
    pub name: String,
    pub channel: String,
    pub value: T,
}

pub(crate) type ChangeHandler<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;
pub(crate) type RequestHandler<T> = Arc<dyn Fn(&T) -> Result<T, Error> + Send + Sync>;

struct PipeState<T> {
    value: Option<T>,
    pending_reply: Option<T>,
    reply_ready: bool,
    awaiting_reply: bool,
    published: bool,
    disposed: bool,
    watcher: Option<DirWatcher>,
    /// File names this instance wrote and must not react to itself. This is
    /// the explicit replacement for the legacy publish/invert flag toggling:
    /// the write path is always the broadcast path, and self-delivery is
    /// filtered per file instead of by mutating shared state around the write.
    suppressed: HashMap<OsString, Instant>,
    on_change: Vec<ChangeHandler<T>>,
    on_request: Option<RequestHandler<T>>,
    group_hook: Option<ChangeHandler<T>>,
}

impl<T> PipeState<T> {
    fn new() -> Self {
        Self {
            value: None,
            pending_reply: None,
            reply_ready: false,
            awaiting_reply: false,
            published: false,
            disposed: false,
            watcher: None,
            suppressed: HashMap::new(),
            on_change: Vec::new(),
            on_request: None,
            group_hook: None,
        }
    }

    fn prune_suppressed(&mut self, retention: Duration) {
        // Anything older than the retention window was swept before our
        // watcher saw it; the entry will never be consumed.
        let cutoff = Instant::now() - retention * 2;
        self.suppressed.retain(|_, written| *written > cutoff);
    }
}

struct Shared<T> {
    address: Address,
    transport: Transport,
    config: PipeConfig,
    state: Mutex<PipeState<T>>,
    reply_cv: Condvar,
}

impl<T> Shared<T> {
    fn lock_state(&self) -> MutexGuard<'_, PipeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One stateful endpoint on an address. Cloning yields another handle to the
/// same instance; dropping the last handle releases the watch.
pub struct Pipe<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("address", &self.shared.address.key())
            .field("published", &self.shared.lock_state().published)
            .finish()
    }
}

impl<T> Pipe<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Base form: the pipe starts unpublished and must be published before it
    /// receives anything. The address directory is created here, and the
    /// retention sweeper is scheduled for it.
    pub fn new(
        name: impl Into<String>,
        channel: impl Into<String>,
        config: PipeConfig,
    ) -> Result<Self, Error> {
        let address = Address::new(name, channel)?;
        let root = config.root.clone().unwrap_or_else(default_root);
        let transport = Transport::new(root, config.retention);
        let shared = Arc::new(Shared {
            address,
            transport,
            config,
            state: Mutex::new(PipeState::new()),
            reply_cv: Condvar::new(),
        });
        let dir = shared.transport.resolve(&shared.address)?;
        sweep::schedule(&dir, shared.transport.retention());
        sweep::schedule_startup(shared.transport.root(), shared.transport.retention());
        Ok(Self { shared })
    }

    /// Convenience form on the default channel, published immediately.
    pub fn open(name: impl Into<String>) -> Result<Self, Error> {
        Self::open_with(name, DEFAULT_CHANNEL, PipeConfig::new())
    }

    pub fn open_on(name: impl Into<String>, channel: impl Into<String>) -> Result<Self, Error> {
        Self::open_with(name, channel, PipeConfig::new())
    }

    pub fn open_with(
        name: impl Into<String>,
        channel: impl Into<String>,
        config: PipeConfig,
    ) -> Result<Self, Error> {
        let pipe = Self::new(name, channel, config)?;
        pipe.publish()?;
        Ok(pipe)
    }

    pub fn name(&self) -> &str {
        self.shared.address.name()
    }

    pub fn channel(&self) -> &str {
        self.shared.address.channel()
    }

    pub fn address_key(&self) -> String {
        self.shared.address.key()
    }

    pub fn is_published(&self) -> bool {
        self.shared.lock_state().published
    }

    /// Last received or locally stored value.
    pub fn value(&self) -> Option<T> {
        self.shared.lock_state().value.clone()
    }

    /// Register the directory watch so this pipe is visible to peers and
    /// receives their messages.
    pub fn publish(&self) -> Result<(), Error> {
        let mut state = self.shared.lock_state();
        if state.disposed {
            return Err(self.disposed_error());
        }
        if state.published {
            return Err(Error::new(ErrorKind::AlreadyPublished)
                .with_message("pipe is already published")
                .with_address(self.shared.address.key()));
        }
        Shared::start_watch(&self.shared, &mut state)
    }

    /// Deregister the watch; the pipe keeps its local value but no longer
    /// observes peers.
    pub fn unpublish(&self) -> Result<(), Error> {
        let mut state = self.shared.lock_state();
        if state.disposed {
            return Err(self.disposed_error());
        }
        if !state.published {
            return Err(Error::new(ErrorKind::AlreadyUnpublished)
                .with_message("pipe is not published")
                .with_address(self.shared.address.key()));
        }
        state.watcher = None;
        state.published = false;
        debug!(address = %self.shared.address.key(), "pipe unpublished");
        Ok(())
    }

    /// Store a value; peers observe it when this pipe is published, but this
    /// pipe's own change event never fires from here.
    pub fn set_local(&self, value: T) -> Result<(), Error> {
        let published = {
            let mut state = self.shared.lock_state();
            if state.disposed {
                return Err(self.disposed_error());
            }
            state.value = Some(value.clone());
            state.published
        };
        if published {
            Shared::write_broadcast(&self.shared, &value, false, true)?;
        }
        Ok(())
    }

    /// Broadcast to every pipe sharing this address. A published sender
    /// receives its own message and fires its own change event, exactly like
    /// any peer.
    pub fn send(&self, value: T) -> Result<(), Error> {
        if self.shared.lock_state().disposed {
            return Err(self.disposed_error());
        }
        Shared::write_broadcast(&self.shared, &value, false, false)
    }

    /// Register a change handler. Handlers run on the watch dispatch worker.
    pub fn on_change(
        &self,
        handler: impl Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let mut state = self.shared.lock_state();
        if state.disposed {
            return Err(self.disposed_error());
        }
        state.on_change.push(Arc::new(handler));
        Ok(())
    }

    /// Register the application responder for inbound requests. Its `Ok`
    /// return is broadcast back on this address tagged as a request reply; an
    /// `Err` is reported and no reply is sent, so the caller times out.
    pub fn on_request(
        &self,
        handler: impl Fn(&T) -> Result<T, Error> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let mut state = self.shared.lock_state();
        if state.disposed {
            return Err(self.disposed_error());
        }
        state.on_request = Some(Arc::new(handler));
        Ok(())
    }

    /// One request/response round trip with the configured deadline.
    pub fn request(&self, value: T) -> Result<T, Error> {
        self.request_with_timeout(value, self.shared.config.request_timeout)
    }

    /// One request/response round trip. Blocks until a reply envelope lands
    /// on this address for this instance, or the deadline passes.
    pub fn request_with_timeout(&self, value: T, timeout: Duration) -> Result<T, Error> {
        let guard = RequestGuard::begin(Arc::clone(&self.shared))?;
        Shared::write_broadcast(&self.shared, &value, true, true)?;

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        while !state.reply_ready {
            if state.disposed {
                drop(state);
                drop(guard);
                return Err(self.disposed_error());
            }
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                drop(guard);
                return Err(Error::new(ErrorKind::Timeout)
                    .with_message("request timed out waiting for a reply")
                    .with_address(self.shared.address.key()));
            }
            let (next, _timed_out) = self
                .shared
                .reply_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        if state.disposed {
            drop(state);
            drop(guard);
            return Err(self.disposed_error());
        }
        let reply = state.pending_reply.take().ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message("reply flag set without a pending reply")
                .with_address(self.shared.address.key())
        })?;
        drop(state);
        drop(guard);
        Ok(reply)
    }

    /// Explicit disposal: stop the watch, drop all handlers, detach from any
    /// aggregated group event. Idempotent; later stateful operations fail
    /// with `Disposed`.
    pub fn close(&self) {
        let mut state = self.shared.lock_state();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.published = false;
        state.watcher = None;
        state.on_change.clear();
        state.on_request = None;
        state.group_hook = None;
        state.pending_reply = None;
        state.reply_ready = true; // wake a blocked request so it can fail
        self.shared.reply_cv.notify_all();
        debug!(address = %self.shared.address.key(), "pipe closed");
    }

    pub(crate) fn set_group_hook(&self, hook: ChangeHandler<T>) {
        self.shared.lock_state().group_hook = Some(hook);
    }

    pub(crate) fn clear_group_hook(&self) {
        self.shared.lock_state().group_hook = None;
    }

    pub(crate) fn request_handler(&self) -> Option<RequestHandler<T>> {
        self.shared.lock_state().on_request.clone()
    }

    pub(crate) fn set_request_handler(&self, handler: RequestHandler<T>) {
        self.shared.lock_state().on_request = Some(handler);
    }

    fn disposed_error(&self) -> Error {
        Error::new(ErrorKind::Disposed)
            .with_message("pipe has been closed")
            .with_address(self.shared.address.key())
    }
}

impl<T> Shared<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn start_watch(shared: &Arc<Self>, state: &mut PipeState<T>) -> Result<(), Error> {
        let dir = shared.transport.resolve(&shared.address)?;
        let weak = Arc::downgrade(shared);
        let watcher = DirWatcher::spawn(
            dir,
            shared.config.poll_interval,
            move |path| {
                if let Some(shared) = weak.upgrade() {
                    Shared::process_file(&shared, &path);
                }
            },
        );
        state.watcher = Some(watcher);
        state.published = true;
        debug!(address = %shared.address.key(), "pipe published");
        Ok(())
    }

    /// The force-broadcast write primitive. Every send variant lands here;
    /// `suppress_self` filters the file out of this instance's own watch.
    fn write_broadcast(
        shared: &Arc<Self>,
        value: &T,
        request: bool,
        suppress_self: bool,
    ) -> Result<(), Error> {
        let path = shared.transport.new_message_path(&shared.address)?;
        let file_name = path.file_name().map(|name| name.to_os_string());
        if suppress_self
            && let Some(name) = file_name.clone()
        {
            let mut state = shared.lock_state();
            state.prune_suppressed(shared.transport.retention());
            state.suppressed.insert(name, Instant::now());
        }
        let envelope = Envelope::new(&shared.address, value.clone(), request);
        let written = shared.transport.write(&path, &envelope);
        if written.is_err()
            && suppress_self
            && let Some(name) = file_name
        {
            shared.lock_state().suppressed.remove(&name);
        }
        written
    }

    fn process_file(shared: &Arc<Self>, path: &Path) {
        {
            let mut state = shared.lock_state();
            state.prune_suppressed(shared.transport.retention());
            if let Some(name) = path.file_name()
                && state.suppressed.remove(name).is_some()
            {
                return;
            }
            // A callback already in flight when the watch was torn down must
            // not deliver to an unpublished pipe.
            if state.disposed || !state.published {
                return;
            }
        }
        match shared.transport.read::<T>(path) {
            Ok(Some(envelope)) => Shared::intercept(shared, envelope),
            // Lost a race with the sweeper, or a partial/foreign payload:
            // nothing to do.
            Ok(None) => {}
            Err(err) => {
                warn!(address = %shared.address.key(), error = %err, "failed to read inbound message");
            }
        }
    }

    fn intercept(shared: &Arc<Self>, envelope: Envelope<T>) {
        if envelope.request {
            let handler = {
                let mut state = shared.lock_state();
                if state.disposed {
                    return;
                }
                if state.awaiting_reply {
                    state.pending_reply = Some(envelope.data);
                    state.reply_ready = true;
                    shared.reply_cv.notify_all();
                    return;
                }
                state.on_request.clone()
            };
            // No responder registered: drop silently.
            let Some(handler) = handler else { return };
            match handler(&envelope.data) {
                Ok(reply) => {
                    if let Err(err) = Shared::write_broadcast(shared, &reply, true, true) {
                        error!(address = %shared.address.key(), error = %err, "failed to send reply");
                    }
                }
                Err(err) => {
                    error!(address = %shared.address.key(), error = %err, "request handler failed; no reply sent");
                }
            }
        } else {
            let (handlers, hook, event) = {
                let mut state = shared.lock_state();
                if state.disposed {
                    return;
                }
                state.value = Some(envelope.data.clone());
                let event = ChangeEvent {
                    name: shared.address.name().to_string(),
                    channel: shared.address.channel().to_string(),
                    value: envelope.data,
                };
                (state.on_change.clone(), state.group_hook.clone(), event)
            };
            for handler in &handlers {
                handler(&event);
            }
            if let Some(hook) = hook {
                hook(&event);
            }
        }
    }
}

/// Scoped request state: forces a transient published+awaiting state and
/// restores what was there before on drop, whichever way the call exits.
struct RequestGuard<T> {
    shared: Arc<Shared<T>>,
    was_published: bool,
}

impl<T> RequestGuard<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn begin(shared: Arc<Shared<T>>) -> Result<Self, Error> {
        let mut state = shared.lock_state();
        if state.disposed {
            return Err(Error::new(ErrorKind::Disposed)
                .with_message("pipe has been closed")
                .with_address(shared.address.key()));
        }
        if state.awaiting_reply {
            return Err(Error::new(ErrorKind::Busy)
                .with_message("a request is already in flight on this pipe")
                .with_address(shared.address.key()));
        }
        let was_published = state.published;
        if !was_published {
            Shared::start_watch(&shared, &mut state)?;
        }
        state.awaiting_reply = true;
        state.reply_ready = false;
        state.pending_reply = None;
        drop(state);
        Ok(Self {
            shared,
            was_published,
        })
    }
}

impl<T> Drop for RequestGuard<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.awaiting_reply = false;
        state.reply_ready = false;
        state.pending_reply = None;
        if !self.was_published && state.published {
            state.watcher = None;
            state.published = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Pipe, PipeConfig};
    use crate::core::error::ErrorKind;
    use std::time::Duration;

    fn config(root: &std::path::Path) -> PipeConfig {
        PipeConfig::new()
            .with_root(root)
            .with_poll_interval(Duration::from_millis(5))
            .with_request_timeout(Duration::from_millis(250))
    }

    #[test]
    fn base_form_starts_unpublished() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<String> = Pipe::new("cmds", "main", config(temp.path())).expect("pipe");
        assert!(!pipe.is_published());
        assert_eq!(pipe.name(), "cmds");
        assert_eq!(pipe.channel(), "main");
        assert_eq!(pipe.address_key(), "main-cmds");
    }

    #[test]
    fn open_form_is_published() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<String> = Pipe::open_with("cmds", "main", config(temp.path())).expect("pipe");
        assert!(pipe.is_published());
    }

    #[test]
    fn double_publish_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<String> = Pipe::open_with("cmds", "main", config(temp.path())).expect("pipe");
        let err = pipe.publish().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::AlreadyPublished);
    }

    #[test]
    fn double_unpublish_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<String> = Pipe::open_with("cmds", "main", config(temp.path())).expect("pipe");
        pipe.unpublish().expect("unpublish");
        let err = pipe.unpublish().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::AlreadyUnpublished);
    }

    #[test]
    fn set_local_stores_value_without_publishing_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<i64> = Pipe::new("cmds", "main", config(temp.path())).expect("pipe");
        pipe.set_local(7).expect("set");
        assert_eq!(pipe.value(), Some(7));
    }

    #[test]
    fn closed_pipe_rejects_operations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<i64> = Pipe::open_with("cmds", "main", config(temp.path())).expect("pipe");
        pipe.close();
        assert_eq!(pipe.send(1).expect_err("err").kind(), ErrorKind::Disposed);
        assert_eq!(
            pipe.set_local(1).expect_err("err").kind(),
            ErrorKind::Disposed
        );
        assert_eq!(pipe.publish().expect_err("err").kind(), ErrorKind::Disposed);
        assert_eq!(
            pipe.unpublish().expect_err("err").kind(),
            ErrorKind::Disposed
        );
        assert_eq!(
            pipe.request(1).expect_err("err").kind(),
            ErrorKind::Disposed
        );
        // close is idempotent
        pipe.close();
    }

    #[test]
    fn request_without_responder_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pipe: Pipe<i64> = Pipe::new("cmds", "main", config(temp.path())).expect("pipe");
        let err = pipe
            .request_with_timeout(5, Duration::from_millis(100))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // prior state restored: still unpublished, next request allowed
        assert!(!pipe.is_published());
        let err = pipe
            .request_with_timeout(5, Duration::from_millis(100))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
