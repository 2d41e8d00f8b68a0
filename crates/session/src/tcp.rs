//! Direct TCP peer connections.
//!
//! The offering side binds an ephemeral listener and announces one candidate
//! per local address. The answering side dials the candidates in arrival
//! order, sends the session token from the offer, and attaches the first
//! stream that connects. The listener attaches the first stream that
//! presents the right token and ignores the rest.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use roomdrop_data_channel::wire::{read_token, write_token};
use roomdrop_data_channel::{ChannelLink, DataChannel, DeliveryFlavor};
use roomdrop_protocol::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::BoxFuture;
use crate::error::NegotiationError;
use crate::peer::{PEER_EVENT_CAPACITY, PeerConnection, PeerConnector, PeerEvent};
use crate::token::SessionToken;

/// Protocol tag carried in TCP descriptions.
const TCP_PROTO: &str = "roomdrop-tcp";

/// How long an accepted stream has to present its token.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for direct TCP connections.
#[derive(Debug, Clone)]
pub struct TcpPeerConfig {
    /// Address the offering side listens on.
    pub bind_addr: IpAddr,
    /// Addresses announced as candidates. When empty, the bind address is
    /// used if it is specific, otherwise every usable local IPv4 address.
    pub candidate_addrs: Vec<IpAddr>,
    pub flavor: DeliveryFlavor,
    pub connect_timeout: Duration,
}

impl Default for TcpPeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            candidate_addrs: Vec::new(),
            flavor: DeliveryFlavor::Buffer,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpPeerConfig {
    /// Loopback-only settings.
    pub fn loopback() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    fn candidate_ips(&self) -> Vec<IpAddr> {
        if !self.candidate_addrs.is_empty() {
            return self.candidate_addrs.clone();
        }
        if !self.bind_addr.is_unspecified() {
            return vec![self.bind_addr];
        }
        let ips = local_ips();
        if ips.is_empty() {
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        } else {
            ips
        }
    }
}

/// Returns the non-loopback, non-link-local IPv4 addresses of this host.
pub fn local_ips() -> Vec<IpAddr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };

    let mut ips = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ipv4) = iface.ip() {
            if ipv4.is_loopback() || ipv4.is_link_local() {
                continue;
            }
            ips.push(IpAddr::V4(ipv4));
        }
    }
    ips
}

#[derive(Debug, Serialize, Deserialize)]
struct TcpDescription {
    proto: String,
    label: String,
    session: String,
}

impl TcpDescription {
    fn new(label: &str, session: &str) -> Self {
        Self {
            proto: TCP_PROTO.to_string(),
            label: label.to_string(),
            session: session.to_string(),
        }
    }

    fn encode(&self) -> Result<SessionDescription, NegotiationError> {
        serde_json::to_string(self)
            .map(SessionDescription::new)
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    fn decode(description: &SessionDescription) -> Result<Self, NegotiationError> {
        let parsed: Self = serde_json::from_str(&description.sdp)
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;
        if parsed.proto != TCP_PROTO {
            return Err(NegotiationError::InvalidDescription(format!(
                "unsupported protocol {}",
                parsed.proto
            )));
        }
        Ok(parsed)
    }
}

/// Builds [`TcpPeer`] connections.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpPeerConfig,
}

impl TcpConnector {
    pub fn new(config: TcpPeerConfig) -> Self {
        Self { config }
    }
}

impl PeerConnector for TcpConnector {
    fn connect(
        &self,
    ) -> BoxFuture<'_, Result<(Box<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError>> {
        let (events, events_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let peer = TcpPeer {
            config: self.config.clone(),
            events,
            cancel: CancellationToken::new(),
            label: None,
            link: None,
            offered: None,
            remote: None,
            pending: Vec::new(),
            dialer: None,
        };
        Box::pin(async move { Ok((Box::new(peer) as Box<dyn PeerConnection>, events_rx)) })
    }
}

/// One side of a direct TCP connection.
pub struct TcpPeer {
    config: TcpPeerConfig,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
    label: Option<String>,
    link: Option<ChannelLink>,
    offered: Option<SessionToken>,
    remote: Option<TcpDescription>,
    // Candidates that arrived before the offer.
    pending: Vec<SocketAddr>,
    dialer: Option<mpsc::UnboundedSender<SocketAddr>>,
}

impl TcpPeer {
    fn start_dialer(&mut self, label: String, token: SessionToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        for addr in self.pending.drain(..) {
            let _ = tx.send(addr);
        }
        tokio::spawn(dial_loop(
            rx,
            label,
            token,
            self.config.flavor,
            self.config.connect_timeout,
            self.events.clone(),
            self.cancel.clone(),
        ));
        self.dialer = Some(tx);
    }
}

impl PeerConnection for TcpPeer {
    fn create_data_channel(&mut self, label: &str) -> Result<DataChannel, NegotiationError> {
        let (channel, link) = DataChannel::new(label, self.config.flavor);
        self.label = Some(label.to_string());
        self.link = Some(link);
        Ok(channel)
    }

    fn create_offer(&mut self) -> BoxFuture<'_, Result<SessionDescription, NegotiationError>> {
        Box::pin(async move {
            let (Some(link), Some(label)) = (self.link.take(), self.label.clone()) else {
                return Err(NegotiationError::NoDataChannel);
            };

            let listener = match TcpListener::bind((self.config.bind_addr, 0)).await {
                Ok(listener) => listener,
                Err(e) => {
                    link.abandon();
                    return Err(e.into());
                }
            };
            let port = listener.local_addr()?.port();
            let token = SessionToken::generate();
            let description = TcpDescription::new(&label, token.as_str()).encode()?;
            info!(port, "direct listener bound");

            tokio::spawn(accept_loop(
                listener,
                link,
                token.clone(),
                self.events.clone(),
                self.cancel.clone(),
            ));
            self.offered = Some(token);

            for ip in self.config.candidate_ips() {
                let mut candidate = IceCandidate::new(SocketAddr::new(ip, port).to_string());
                candidate.sdp_mid = Some(label.clone());
                candidate.sdp_m_line_index = Some(0);
                if self.events.try_send(PeerEvent::LocalCandidate(candidate)).is_err() {
                    warn!(%ip, "candidate queue full, candidate dropped");
                }
            }
            Ok(description)
        })
    }

    fn create_answer(&mut self) -> BoxFuture<'_, Result<SessionDescription, NegotiationError>> {
        Box::pin(async move {
            let remote = self.remote.as_ref().ok_or(NegotiationError::NoRemoteOffer)?;
            TcpDescription::new(&remote.label, &remote.session).encode()
        })
    }

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), NegotiationError>> {
        Box::pin(async move {
            let remote = TcpDescription::decode(&description)?;

            if let Some(token) = &self.offered {
                return if token.matches(&remote.session) {
                    Ok(())
                } else {
                    Err(NegotiationError::InvalidDescription(
                        "answer does not match our offer".into(),
                    ))
                };
            }
            if self.remote.is_some() {
                return Err(NegotiationError::InvalidDescription(
                    "remote offer already applied".into(),
                ));
            }

            let token = SessionToken::parse(&remote.session).ok_or_else(|| {
                NegotiationError::InvalidDescription("malformed session token".into())
            })?;
            self.start_dialer(remote.label.clone(), token);
            self.remote = Some(remote);
            Ok(())
        })
    }

    fn add_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), NegotiationError>> {
        Box::pin(async move {
            let addr: SocketAddr = candidate
                .candidate
                .parse()
                .map_err(|_| NegotiationError::InvalidCandidate(candidate.candidate.clone()))?;

            if self.offered.is_some() {
                trace!(%addr, "offering side ignores remote candidates");
                return Ok(());
            }
            match &self.dialer {
                Some(dialer) => {
                    let _ = dialer.send(addr);
                }
                None => self.pending.push(addr),
            }
            Ok(())
        })
    }

    fn close(&mut self) {
        self.cancel.cancel();
        self.dialer = None;
        if let Some(link) = self.link.take() {
            link.abandon();
        }
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Accepts streams until one presents `token`, then attaches it to `link`.
async fn accept_loop(
    listener: TcpListener,
    link: ChannelLink,
    token: SessionToken,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let (mut stream, addr) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                link.abandon();
                return;
            }
            result = listener.accept() => match result {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("direct listener failed: {e}");
                    let _ = events.send(PeerEvent::Failed(format!("accept failed: {e}"))).await;
                    link.abandon();
                    return;
                }
            }
        };
        debug!(%addr, "direct connection accepted");

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                link.abandon();
                return;
            }
            result = tokio::time::timeout(TOKEN_TIMEOUT, read_token(&mut stream)) => result,
        };

        match received {
            Ok(Ok(received)) if token.matches(&received) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed: {e}");
                }
                info!(%addr, "direct connection authenticated");
                link.attach_stream(stream);
                return;
            }
            Ok(Ok(_)) => warn!(%addr, "direct connection rejected: invalid token"),
            Ok(Err(e)) => warn!(%addr, "direct connection rejected: {e}"),
            Err(_) => warn!(%addr, "direct connection rejected: no token"),
        }
    }
}

/// Dials candidates one at a time until one connects.
async fn dial_loop(
    mut addrs: mpsc::UnboundedReceiver<SocketAddr>,
    label: String,
    token: SessionToken,
    flavor: DeliveryFlavor,
    connect_timeout: Duration,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let addr = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            addr = addrs.recv() => match addr {
                Some(addr) => addr,
                None => return,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = dial(addr, &token, connect_timeout) => result,
        };

        match result {
            Ok(stream) => {
                info!(%addr, "direct connection established");
                let (channel, link) = DataChannel::new(label, flavor);
                link.attach_stream(stream);
                let _ = events.send(PeerEvent::DataChannel(channel)).await;
                return;
            }
            Err(e) => debug!(%addr, "dial failed: {e}"),
        }
    }
}

async fn dial(
    addr: SocketAddr,
    token: &SessionToken,
    connect_timeout: Duration,
) -> Result<TcpStream, NegotiationError> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NegotiationError::Timeout(connect_timeout))??;
    stream.set_nodelay(true)?;
    write_token(&mut stream, token.as_str()).await?;
    Ok(stream)
}
