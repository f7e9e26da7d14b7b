//! Per-connection state shared by the connection tasks and command handlers

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use encoding_rs::Encoding;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::SecureConnectionAdapterManager;
use crate::config::ServerConfig;
use crate::data::{DataChannel, DataConnection};
use crate::dispatch::{CommandMiddleware, Middleware};
use crate::fs::{EmptyFileSystem, FileSystem, FileSystemFactory, LocalFileSystemFactory};
use crate::handlers::HandlerRegistry;
use crate::keepalive::ActivityKeepAlive;
use crate::localization::{Catalog, CatalogLoader, DefaultCatalogLoader};
use crate::login::{
    AnonymousAuthenticator, Authenticator, LoginStateMachine, Principal, StaticPasswordAuthenticator,
};
use crate::server_command::ServerCommandQueue;
use crate::stats::StatisticsCollector;
use crate::tls::TlsIdentity;
use crate::xferlog::TransferLog;

/// Server-wide collaborators, shared by every connection.
pub struct Services {
    pub config: ServerConfig,
    pub default_encoding: &'static Encoding,
    pub authenticators: Vec<Box<dyn Authenticator>>,
    pub file_systems: Arc<dyn FileSystemFactory>,
    pub catalogs: Arc<dyn CatalogLoader>,
    pub tls: Option<TlsIdentity>,
    pub collectors: Vec<Arc<dyn StatisticsCollector>>,
    pub handlers: HandlerRegistry,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub command_middleware: Vec<Arc<dyn CommandMiddleware>>,
}

impl Services {
    /// Default wiring: local file system under `config.root`, anonymous and
    /// configured accounts, English replies.
    pub fn from_config(config: ServerConfig, tls: Option<TlsIdentity>) -> anyhow::Result<Self> {
        config.validate()?;
        let default_encoding = config.control_encoding()?;
        let file_systems = Arc::new(LocalFileSystemFactory::new(&config.root)?);

        let mut authenticators: Vec<Box<dyn Authenticator>> = Vec::new();
        if config.anonymous {
            authenticators.push(Box::new(AnonymousAuthenticator));
        }
        if !config.users.is_empty() {
            authenticators.push(Box::new(StaticPasswordAuthenticator::new(config.users.clone())));
        }

        let mut collectors: Vec<Arc<dyn StatisticsCollector>> = Vec::new();
        if let Some(path) = &config.transfer_log {
            let log = TransferLog::new(path).context("open transfer log")?;
            info!(path = %log.path().display(), "transfer log enabled");
            collectors.push(Arc::new(log));
        }

        Ok(Self {
            config,
            default_encoding,
            authenticators,
            file_systems,
            catalogs: Arc::new(DefaultCatalogLoader::default()),
            tls,
            collectors,
            handlers: HandlerRegistry::default(),
            middleware: crate::dispatch::default_middleware(),
            command_middleware: crate::dispatch::default_command_middleware(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Ascii,
    Image,
}

/// `PROT` level for data connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataProtection {
    Clear,
    Private,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSecurity {
    Plain,
    /// Upgraded with `AUTH TLS`; can be dropped again with `CCC`.
    Explicit,
    /// TLS from the first byte.
    Implicit,
}

/// Mutable session values reset by `REIN`.
pub struct SessionState {
    pub file_system: Arc<dyn FileSystem>,
    /// Working directory, root is the empty stack
    pub path: Vec<String>,
    pub user: Option<Principal>,
    pub catalog: Arc<Catalog>,
    pub encoding: &'static Encoding,
    /// Encoding override for `NLST` output
    pub nlst_encoding: Option<&'static Encoding>,
    pub file_type: FileType,
    pub data_protection: DataProtection,
    pub control_security: ControlSecurity,
}

impl SessionState {
    fn initial(services: &Services, control_security: ControlSecurity) -> Self {
        let language = services.catalogs.default_language().to_string();
        Self {
            file_system: Arc::new(EmptyFileSystem),
            path: Vec::new(),
            user: None,
            catalog: services.catalogs.load(&language).unwrap_or_default(),
            encoding: services.default_encoding,
            nlst_encoding: None,
            file_type: FileType::Ascii,
            data_protection: DataProtection::Clear,
            control_security,
        }
    }
}

/// Optional protocol extension state attached to a connection.
pub trait Extension: Send + Sync + 'static {
    /// Called on `REIN`. Returning `false` removes (and disposes) the extension.
    fn reset(&mut self) -> bool {
        false
    }

    fn dispose(&mut self) {}
}

type AnyExtension = Box<dyn Any + Send + Sync>;

struct ExtensionSlot {
    value: AnyExtension,
    reset: fn(&mut AnyExtension) -> bool,
    dispose: fn(&mut AnyExtension),
}

fn reset_slot<T: Extension>(value: &mut AnyExtension) -> bool {
    value.downcast_mut::<T>().map(T::reset).unwrap_or(false)
}

fn dispose_slot<T: Extension>(value: &mut AnyExtension) {
    if let Some(v) = value.downcast_mut::<T>() {
        v.dispose();
    }
}

/// Type keyed map of [`Extension`] values.
#[derive(Default)]
pub struct Extensions {
    slots: Mutex<HashMap<TypeId, ExtensionSlot>>,
}

impl Extensions {
    pub fn insert<T: Extension>(&self, value: T) {
        let slot = ExtensionSlot { value: Box::new(value), reset: reset_slot::<T>, dispose: dispose_slot::<T> };
        if let Some(mut old) = self.slots.lock().insert(TypeId::of::<T>(), slot) {
            (old.dispose)(&mut old.value);
        }
    }

    pub fn with<T: Extension, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.lock();
        slots.get(&TypeId::of::<T>()).and_then(|s| s.value.downcast_ref::<T>()).map(f)
    }

    pub fn contains<T: Extension>(&self) -> bool {
        self.slots.lock().contains_key(&TypeId::of::<T>())
    }

    /// Removes the value and hands it back undisposed.
    pub fn take<T: Extension>(&self) -> Option<T> {
        let slot = self.slots.lock().remove(&TypeId::of::<T>())?;
        slot.value.downcast::<T>().ok().map(|value| *value)
    }

    pub fn reset_all(&self) {
        self.slots.lock().retain(|_, slot| {
            if (slot.reset)(&mut slot.value) {
                true
            } else {
                (slot.dispose)(&mut slot.value);
                false
            }
        });
    }

    pub fn dispose_all(&self) {
        for (_, mut slot) in self.slots.lock().drain() {
            (slot.dispose)(&mut slot.value);
        }
    }
}

/// Held by an abortable command until its final reply is queued. The task
/// may still be winding down afterwards; the next command doesn't wait for it.
#[derive(Clone, Debug)]
pub struct BackgroundSlot(Arc<AtomicBool>);

impl BackgroundSlot {
    fn held() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The abortable command currently running, if any.
pub struct BackgroundTask {
    pub verb: String,
    pub handle: JoinHandle<()>,
    pub cancel: CancellationToken,
    slot: BackgroundSlot,
}

impl BackgroundTask {
    fn busy(&self) -> bool {
        self.slot.is_held() && !self.handle.is_finished()
    }
}

/// How long `ABOR` and teardown wait for a cancelled command to unwind.
const BACKGROUND_UNWIND: Duration = Duration::from_secs(10);

pub struct ConnectionContext {
    id: String,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    pub services: Arc<Services>,
    pub session: Mutex<SessionState>,
    pub login: Mutex<LoginStateMachine>,
    pub extensions: Extensions,
    pub server_commands: ServerCommandQueue,
    pub adapter: tokio::sync::Mutex<SecureConnectionAdapterManager>,
    background: Mutex<Option<BackgroundTask>>,
    background_done: Notify,
    data: Mutex<DataChannel>,
    pub keepalive: ActivityKeepAlive,
    closed: CancellationToken,
}

impl ConnectionContext {
    pub fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        services: Arc<Services>,
        control_security: ControlSecurity,
        server_commands: ServerCommandQueue,
        adapter: SecureConnectionAdapterManager,
        closed: CancellationToken,
    ) -> Self {
        let session = SessionState::initial(&services, control_security);
        let keepalive = ActivityKeepAlive::new(services.config.idle_timeout());
        Self {
            id: format!("FTP-{}", uuid::Uuid::new_v4().simple()),
            local_addr,
            remote_addr,
            services,
            session: Mutex::new(session),
            login: Mutex::new(LoginStateMachine::default()),
            extensions: Extensions::default(),
            server_commands,
            adapter: tokio::sync::Mutex::new(adapter),
            background: Mutex::new(None),
            background_done: Notify::new(),
            data: Mutex::new(DataChannel::None),
            keepalive,
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Connection-wide cancellation, fired once when the connection ends.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn control_encoding(&self) -> &'static Encoding {
        self.session.lock().encoding
    }

    /// Translates a reply text with the session's catalog.
    pub fn t(&self, message: &str) -> String {
        self.session.lock().catalog.translate(message).to_string()
    }

    pub fn notify(&self, f: impl Fn(&dyn StatisticsCollector)) {
        for c in &self.services.collectors {
            f(c.as_ref());
        }
    }

    pub fn user(&self) -> Option<Principal> {
        self.session.lock().user.clone()
    }

    /// Switches the session to a freshly authorized user.
    pub fn set_user(&self, principal: Principal, file_system: Arc<dyn FileSystem>) {
        {
            let mut session = self.session.lock();
            session.file_system = file_system;
            session.path.clear();
            session.user = Some(principal.clone());
        }
        self.notify(|c| c.user_changed(&self.id, Some(&principal)));
    }

    pub fn data_protection(&self) -> DataProtection {
        self.session.lock().data_protection
    }

    pub fn control_security(&self) -> ControlSecurity {
        self.session.lock().control_security
    }

    pub fn set_data_channel(&self, channel: DataChannel) {
        *self.data.lock() = channel;
    }

    pub fn take_data_channel(&self) -> DataChannel {
        std::mem::replace(&mut *self.data.lock(), DataChannel::None)
    }

    /// Keeps a data connection for the next transfer (reply `250`).
    pub fn park_data_connection(&self, connection: DataConnection) {
        *self.data.lock() = DataChannel::Open(connection);
    }

    pub fn background_running(&self) -> bool {
        self.background.lock().as_ref().is_some_and(BackgroundTask::busy)
    }

    /// Claims the background slot. Fails when another abortable command is
    /// still running; the task is only spawned once the slot is ours.
    pub fn start_background<F>(&self, verb: &str, cancel: CancellationToken, task: F) -> bool
    where
        F: FnOnce(BackgroundSlot) -> JoinHandle<()>,
    {
        let mut current = self.background.lock();
        if current.as_ref().is_some_and(BackgroundTask::busy) {
            return false;
        }
        if let Some(previous) = current.take() {
            debug!(command = %previous.verb, "background command released its slot");
        }
        let slot = BackgroundSlot::held();
        let handle = task(slot.clone());
        *current = Some(BackgroundTask { verb: verb.to_string(), handle, cancel, slot });
        true
    }

    /// Called by the background task itself when it's done.
    pub fn background_finished(&self) {
        self.background_done.notify_one();
    }

    pub async fn background_completed(&self) {
        self.background_done.notified().await
    }

    /// Clears the slot if its task has finished.
    pub fn clear_finished_background(&self) {
        let mut slot = self.background.lock();
        if slot.as_ref().is_some_and(|t| t.handle.is_finished()) {
            if let Some(task) = slot.take() {
                debug!(command = %task.verb, "background command finished");
            }
        }
    }

    /// Cancels the running abortable command and waits for it to unwind.
    /// Returns whether a command was running.
    pub async fn abort_background(&self) -> bool {
        let Some(task) = self.background.lock().take() else {
            return false;
        };
        let was_running = task.busy();
        task.cancel.cancel();
        let mut handle = task.handle;
        if tokio::time::timeout(BACKGROUND_UNWIND, &mut handle).await.is_err() {
            warn!(command = %task.verb, "background command ignored cancellation");
            handle.abort();
        }
        was_running
    }

    /// `REIN`: back to the state of a freshly connected client. The control
    /// connection and its TLS session stay as they are.
    pub async fn reset(&self) {
        self.abort_background().await;
        self.login.lock().reset();
        {
            let mut session = self.session.lock();
            let security = session.control_security;
            *session = SessionState::initial(&self.services, security);
        }
        self.extensions.reset_all();
        if let DataChannel::Open(conn) = self.take_data_channel() {
            conn.close().await;
        }
        self.notify(|c| c.user_changed(&self.id, None));
    }

    /// Ends an explicit TLS session on the control connection (`CCC`),
    /// returning the adapter to pass-through.
    pub async fn close_control_tls(&self) -> anyhow::Result<()> {
        if self.control_security() != ControlSecurity::Explicit {
            anyhow::bail!("control connection is not using explicit TLS");
        }
        self.adapter.lock().await.reset().await.context("reset connection adapter")?;
        let mut session = self.session.lock();
        session.control_security = ControlSecurity::Plain;
        session.data_protection = DataProtection::Clear;
        Ok(())
    }

    /// Releases per-connection resources at teardown.
    pub async fn dispose(&self) {
        self.abort_background().await;
        if let DataChannel::Open(conn) = self.take_data_channel() {
            conn.close().await;
        }
        self.extensions.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);
    impl Extension for Counter {
        fn dispose(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Sticky(u32);
    impl Extension for Sticky {
        fn reset(&mut self) -> bool {
            self.0 = 0;
            true
        }
    }

    #[test]
    fn reset_keeps_resettable_and_disposes_the_rest() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let ext = Extensions::default();
        ext.insert(Counter(disposed.clone()));
        ext.insert(Sticky(7));
        ext.reset_all();
        assert!(!ext.contains::<Counter>());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(ext.with::<Sticky, _>(|s| s.0), Some(0));
    }

    #[test]
    fn replacing_an_extension_disposes_the_old_value() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let ext = Extensions::default();
        ext.insert(Counter(disposed.clone()));
        ext.insert(Counter(disposed.clone()));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        ext.dispose_all();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert!(!ext.contains::<Counter>());
    }

    #[test]
    fn taken_extensions_are_not_disposed() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let ext = Extensions::default();
        ext.insert(Counter(disposed.clone()));
        assert!(ext.take::<Counter>().is_some());
        assert!(ext.take::<Counter>().is_none());
        ext.dispose_all();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::pipe::{connection_pipe, SocketPump, TransportInput};
    use crate::protocol::PIPE_BUFFER_SIZE;
    use crate::server_command::{server_command_queue, ServerCommandReceiver};
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    /// A connection context wired to in-memory pipes. Server commands are
    /// left in `commands` for the test to inspect.
    pub(crate) struct TestConnection {
        pub ctx: Arc<ConnectionContext>,
        pub commands: ServerCommandReceiver,
        pub root: TempDir,
        pub client: DuplexStream,
        pub input: TransportInput,
        _pump: SocketPump,
    }

    pub(crate) fn connection(configure: impl FnOnce(&mut Services)) -> TestConnection {
        let root = TempDir::new().unwrap();
        let config = ServerConfig { root: root.path().to_path_buf(), anonymous: true, ..ServerConfig::default() };
        let mut services = Services::from_config(config, None).unwrap();
        configure(&mut services);

        let closed = CancellationToken::new();
        let (client, server) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let (socket, pump) = SocketPump::start(server, closed.clone());
        let (sink, input) = connection_pipe();
        let adapter = SecureConnectionAdapterManager::new(socket, sink, closed.clone());
        let (queue, commands) = server_command_queue();
        let ctx = ConnectionContext::new(
            "127.0.0.1:21".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            Arc::new(services),
            ControlSecurity::Plain,
            queue,
            adapter,
            closed,
        );
        TestConnection { ctx: Arc::new(ctx), commands, root, client, input, _pump: pump }
    }
}
