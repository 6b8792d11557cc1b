//! SSH reverse proxy
//!
//! The gateway completes a server-side handshake with the client using
//! its own host key and accepts whatever authentication the client
//! offers, since verifying users is the backend's job. The username
//! selects the tenant container; the gateway then dials its sshd
//! and authenticates as the requested user with the persisted gateway
//! key. From there, channels and channel requests are bridged between
//! the two connections.
//!
//! Each bridged channel runs one task that pumps backend messages to
//! the client and client events (delivered by the server handler) to
//! the backend. `exit-status`/`exit-signal` from the backend is the
//! authoritative end-of-session signal: byte-pump EOF alone is not
//! enough because interactive sessions keep stdin open indefinitely.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::{client, ChannelId, ChannelMsg, Disconnect, Pty, Sig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::timeout;
use crate::identity::SshIdentity;
use crate::proxy::GatewayServer;
use crate::router::RouteState;

/// Capacity of the per-channel event queue from the server handler to
/// the bridge task. Bounded so a stalled backend back-pressures the
/// client instead of buffering without limit.
const CHANNEL_EVENT_BUFFER: usize = 64;

/// Build the russh server configuration around the gateway host key.
pub(crate) fn server_config(identity: &SshIdentity) -> russh::server::Config {
    russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![identity.host_key().clone()],
        ..Default::default()
    }
}

/// Split the SSH username into `(target_user, container_id)` on the
/// last dot. A bare username addresses root on that container.
pub(crate) fn parse_username(user: &str) -> (String, String) {
    match user.rsplit_once('.') {
        Some((target_user, container_id)) => (target_user.to_string(), container_id.to_string()),
        None => ("root".to_string(), user.to_string()),
    }
}

impl GatewayServer {
    /// Run the SSH proxy over an accepted connection.
    pub(crate) async fn handle_ssh<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Single close path for the whole proxy: fired on exit-status,
        // on either connection ending, or on handshake failure.
        let closer = CancellationToken::new();

        let handler = ProxyHandler {
            state: self.state_arc(),
            client_key: self.identity().client_key(),
            peer,
            closer: closer.clone(),
            username: None,
            backend: None,
            channels: HashMap::new(),
        };

        let mut session =
            match russh::server::run_stream(self.ssh_config(), stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    debug!("SSH handshake failed client={}: {}", peer, e);
                    return;
                }
            };

        let handle = session.handle();
        let token = closer.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = handle
                .disconnect(Disconnect::ByApplication, "session closed".into(), "".into())
                .await;
        });

        if let Err(e) = session.await {
            debug!("SSH session ended client={}: {}", peer, e);
        }
        closer.cancel();
    }
}

/// Events the server handler forwards to a channel's bridge task
enum ChannelEvent {
    Data(Vec<u8>),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
        reply: oneshot::Sender<bool>,
    },
    Shell {
        reply: oneshot::Sender<bool>,
    },
    Exec {
        command: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Subsystem {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Env {
        name: String,
        value: String,
        reply: oneshot::Sender<bool>,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Eof,
    Close,
}

/// Accepts the client side of the proxy and mirrors everything onto
/// the backend connection.
struct ProxyHandler {
    state: Arc<RouteState>,
    client_key: Arc<PrivateKey>,
    peer: SocketAddr,
    closer: CancellationToken,
    username: Option<String>,
    backend: Option<BackendHandle>,
    channels: HashMap<ChannelId, mpsc::Sender<ChannelEvent>>,
}

type BackendHandle = Arc<Mutex<client::Handle<BackendHandler>>>;

impl ProxyHandler {
    /// The backend connection, opening it on first use.
    async fn ensure_backend(&mut self) -> Result<BackendHandle> {
        if let Some(backend) = self.backend.clone() {
            return Ok(backend);
        }
        self.connect_backend().await
    }

    /// Resolve the username to a container and open the backend SSH
    /// connection, authenticating with the gateway key.
    async fn connect_backend(&mut self) -> Result<BackendHandle> {
        let user = self.username.clone().unwrap_or_default();
        let (target_user, container_id) = parse_username(&user);
        info!(
            "SSH connection container={} user={} client={}",
            container_id, target_user, self.peer
        );

        let container = self
            .state
            .resolve_ssh(&container_id)
            .map_err(|e| anyhow!("container {} not resolvable: {}", container_id, e))?;

        let addr = container.ssh_addr();
        debug!("connecting to backend addr={}", addr);

        let stream = tokio::time::timeout(timeout::BACKEND_DIAL, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("backend dial timed out addr={}", addr))?
            .with_context(|| format!("connect to backend {}", addr))?;

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, BackendHandler)
            .await
            .context("backend SSH handshake")?;

        let key = PrivateKeyWithHashAlg::new(self.client_key.clone(), None);
        let auth = handle
            .authenticate_publickey(target_user.clone(), key)
            .await
            .context("backend SSH auth")?;
        if !matches!(auth, client::AuthResult::Success) {
            bail!(
                "backend rejected gateway key container={} user={}",
                container_id,
                target_user
            );
        }

        info!(
            "proxying SSH session container={} backend={}",
            container_id, addr
        );

        let backend = Arc::new(Mutex::new(handle));
        let token = self.closer.clone();
        let watcher = backend.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = watcher
                .lock()
                .await
                .disconnect(Disconnect::ByApplication, "session closed".into(), "".into())
                .await;
        });

        self.backend = Some(backend.clone());
        Ok(backend)
    }

    /// Spawn a bridge for a freshly opened pair of channels.
    fn spawn_bridge(
        &mut self,
        client_id: ChannelId,
        backend_channel: russh::Channel<client::Msg>,
        session: &mut Session,
    ) {
        let (tx, rx) = mpsc::channel(CHANNEL_EVENT_BUFFER);
        self.channels.insert(client_id, tx);

        let bridge = ChannelBridge {
            client_id,
            server_handle: session.handle(),
            backend_channel,
            events: rx,
            closer: self.closer.clone(),
        };
        tokio::spawn(bridge.run());
    }

    /// Queue an event for the channel's bridge task; lost events mean
    /// the bridge is already gone, which is fine during teardown.
    async fn send_event(&mut self, channel: ChannelId, event: ChannelEvent) {
        if let Some(tx) = self.channels.get(&channel) {
            let _ = tx.send(event).await;
        }
    }

    /// Forward a channel request and wait for the backend's verdict.
    async fn forward_request<F>(&mut self, channel: ChannelId, make: F) -> bool
    where
        F: FnOnce(oneshot::Sender<bool>) -> ChannelEvent,
    {
        let Some(tx) = self.channels.get(&channel) else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(make(reply_tx)).await.is_err() {
            return false;
        }
        matches!(
            tokio::time::timeout(timeout::REQUEST_REPLY, reply_rx).await,
            Ok(Ok(true))
        )
    }
}

impl russh::server::Handler for ProxyHandler {
    type Error = anyhow::Error;

    // Authentication is not the gateway's job: every offered method is
    // accepted and the backend decides whether the gateway key grants
    // the requested user.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        self.username = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        // Returning an error tears the session down, which is the
        // required silent close for unresolvable containers and
        // unreachable backends.
        match self.connect_backend().await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("SSH proxy setup failed client={}: {:#}", self.peer, e);
                Err(e)
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let backend = match self.ensure_backend().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("no backend for session channel client={}: {:#}", self.peer, e);
                return Ok(false);
            }
        };

        let result = backend.lock().await.channel_open_session().await;
        match result {
            Ok(backend_channel) => {
                debug!("proxying channel type=session client={}", self.peer);
                self.spawn_bridge(channel.id(), backend_channel, session);
                Ok(true)
            }
            Err(e) => {
                error!("failed to open session channel on backend: {}", e);
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: russh::Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let backend = match self.ensure_backend().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("no backend for direct-tcpip channel client={}: {:#}", self.peer, e);
                return Ok(false);
            }
        };

        let opened = backend
            .lock()
            .await
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await;
        match opened {
            Ok(backend_channel) => {
                debug!(
                    "proxying channel type=direct-tcpip target={}:{} client={}",
                    host_to_connect, port_to_connect, self.peer
                );
                self.spawn_bridge(channel.id(), backend_channel, session);
                Ok(true)
            }
            Err(e) => {
                error!("failed to open direct-tcpip channel on backend: {}", e);
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_event(channel, ChannelEvent::Data(data.to_vec())).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_event(channel, ChannelEvent::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_event(channel, ChannelEvent::Close).await;
        self.channels.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let term = term.to_string();
        let modes = modes.to_vec();
        let ok = self
            .forward_request(channel, |reply| ChannelEvent::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
                reply,
            })
            .await;
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self
            .forward_request(channel, |reply| ChannelEvent::Shell { reply })
            .await;
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = data.to_vec();
        let ok = self
            .forward_request(channel, |reply| ChannelEvent::Exec { command, reply })
            .await;
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let name = name.to_string();
        let ok = self
            .forward_request(channel, |reply| ChannelEvent::Subsystem { name, reply })
            .await;
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let name = variable_name.to_string();
        let value = variable_value.to_string();
        let ok = self
            .forward_request(channel, |reply| ChannelEvent::Env { name, value, reply })
            .await;
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_event(
            channel,
            ChannelEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_event(channel, ChannelEvent::Signal(signal)).await;
        Ok(())
    }

    // Global requests from either side are discarded
    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

/// Client-side handler for the backend connection. Backend host keys
/// are not pinned; the cluster network is the trust boundary here.
struct BackendHandler;

impl client::Handler for BackendHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Pumps one bridged channel: backend messages to the client session,
/// client events to the backend channel. Replies to forwarded requests
/// come back in order, so a FIFO of pending reply slots maps each
/// backend success/failure to the request that caused it.
struct ChannelBridge {
    client_id: ChannelId,
    server_handle: russh::server::Handle,
    backend_channel: russh::Channel<client::Msg>,
    events: mpsc::Receiver<ChannelEvent>,
    closer: CancellationToken,
}

impl ChannelBridge {
    async fn run(mut self) {
        let mut pending: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
        let mut client_closed = false;

        loop {
            tokio::select! {
                msg = self.backend_channel.wait() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_backend_msg(msg, &mut pending).await {
                                break;
                            }
                        }
                        None => {
                            // Backend channel is gone; mirror the close
                            let _ = self.server_handle.close(self.client_id).await;
                            break;
                        }
                    }
                }
                event = self.events.recv(), if !client_closed => {
                    match event {
                        Some(ChannelEvent::Close) => {
                            let _ = self.backend_channel.close().await;
                            client_closed = true;
                        }
                        Some(event) => self.handle_client_event(event, &mut pending).await,
                        None => {
                            // Handler dropped the sender: session teardown
                            let _ = self.backend_channel.close().await;
                            client_closed = true;
                        }
                    }
                }
            }
        }

        debug!("channel bridge finished channel={:?}", self.client_id);
    }

    /// Returns true when the bridge should stop.
    async fn handle_backend_msg(
        &mut self,
        msg: ChannelMsg,
        pending: &mut VecDeque<oneshot::Sender<bool>>,
    ) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                if self.server_handle.data(self.client_id, data).await.is_err() {
                    return true;
                }
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if self
                    .server_handle
                    .extended_data(self.client_id, ext, data)
                    .await
                    .is_err()
                {
                    return true;
                }
            }
            ChannelMsg::Eof => {
                let _ = self.server_handle.eof(self.client_id).await;
            }
            ChannelMsg::Close => {
                let _ = self.server_handle.close(self.client_id).await;
                return true;
            }
            ChannelMsg::Success => {
                if let Some(reply) = pending.pop_front() {
                    let _ = reply.send(true);
                }
            }
            ChannelMsg::Failure => {
                if let Some(reply) = pending.pop_front() {
                    let _ = reply.send(false);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                debug!(
                    "backend exit-status channel={:?} status={}",
                    self.client_id, exit_status
                );
                let _ = self
                    .server_handle
                    .exit_status_request(self.client_id, exit_status)
                    .await;
                self.finish().await;
                return true;
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                debug!(
                    "backend exit-signal channel={:?} signal={:?}",
                    self.client_id, signal_name
                );
                let _ = self
                    .server_handle
                    .exit_signal_request(
                        self.client_id,
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    )
                    .await;
                self.finish().await;
                return true;
            }
            _ => {}
        }
        false
    }

    /// The authoritative close: shut both channel sides, then fire the
    /// proxy-wide close signal that disconnects both SSH connections.
    async fn finish(&mut self) {
        let _ = self.server_handle.close(self.client_id).await;
        let _ = self.backend_channel.close().await;
        self.closer.cancel();
    }

    async fn handle_client_event(
        &mut self,
        event: ChannelEvent,
        pending: &mut VecDeque<oneshot::Sender<bool>>,
    ) {
        match event {
            ChannelEvent::Data(bytes) => {
                if let Err(e) = self.backend_channel.data(&bytes[..]).await {
                    debug!("data forward failed channel={:?}: {}", self.client_id, e);
                }
            }
            ChannelEvent::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
                reply,
            } => {
                let result = self
                    .backend_channel
                    .request_pty(
                        true,
                        &term,
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                        &modes,
                    )
                    .await;
                Self::track_reply(result, reply, pending);
            }
            ChannelEvent::Shell { reply } => {
                let result = self.backend_channel.request_shell(true).await;
                Self::track_reply(result, reply, pending);
            }
            ChannelEvent::Exec { command, reply } => {
                let result = self.backend_channel.exec(true, command).await;
                Self::track_reply(result, reply, pending);
            }
            ChannelEvent::Subsystem { name, reply } => {
                let result = self.backend_channel.request_subsystem(true, &name).await;
                Self::track_reply(result, reply, pending);
            }
            ChannelEvent::Env { name, value, reply } => {
                let result = self.backend_channel.set_env(true, name, value).await;
                Self::track_reply(result, reply, pending);
            }
            ChannelEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                let _ = self
                    .backend_channel
                    .window_change(col_width, row_height, pix_width, pix_height)
                    .await;
            }
            ChannelEvent::Signal(signal) => {
                let _ = self.backend_channel.signal(signal).await;
            }
            ChannelEvent::Eof => {
                let _ = self.backend_channel.eof().await;
            }
            // Close is handled in the run loop
            ChannelEvent::Close => {}
        }
    }

    /// A request that reached the backend gets its reply slot queued;
    /// one that never left fails immediately.
    fn track_reply(
        result: Result<(), russh::Error>,
        reply: oneshot::Sender<bool>,
        pending: &mut VecDeque<oneshot::Sender<bool>>,
    ) {
        match result {
            Ok(()) => pending.push_back(reply),
            Err(e) => {
                debug!("request forward failed: {}", e);
                let _ = reply.send(false);
            }
        }
    }
}
