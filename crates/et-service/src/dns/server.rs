//! UDP listeners, upstream connections and the query processing task

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hickory_proto::op::{Header, Message, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use et_core::config::{ServiceConfig, TunAddress};
use et_core::netconfig::NetworkConfigurator;

use super::proxy::{correlation_id, PendingQuery, PendingTable};
use super::resolver::InterceptTable;

/// TTL of locally synthesized answers, in seconds
pub const LOCAL_ANSWER_TTL: u32 = 60;

const MAX_PACKET_SIZE: usize = 4096;
const QUEUE_CAPACITY: usize = 64;

/// Runtime parameters of the DNS subsystem
#[derive(Debug, Clone)]
pub struct DnsSettings {
    /// Addresses to listen on
    pub listen: Vec<SocketAddr>,
    /// Port used on each upstream resolver
    pub upstream_port: u16,
    /// Used when the system reports no upstream resolvers
    pub fallback_resolvers: Vec<IpAddr>,
    pub proxy_timeout: Duration,
    pub sweep_interval: Duration,
}

impl DnsSettings {
    /// Listen on the configured addresses, or on the tun address when none are set
    pub fn from_config(config: &ServiceConfig, tun: &TunAddress) -> Self {
        let listen = if config.dns_addresses.is_empty() {
            vec![SocketAddr::new(IpAddr::V4(tun.ip), config.dns_port)]
        } else {
            config
                .dns_addresses
                .iter()
                .map(|ip| SocketAddr::new(*ip, config.dns_port))
                .collect()
        };

        Self {
            listen,
            upstream_port: config.upstream_port,
            fallback_resolvers: config.fallback_resolvers.clone(),
            proxy_timeout: config.proxy_timeout,
            sweep_interval: config.sweep_interval,
        }
    }
}

/// A running DNS resolver/proxy
pub struct DnsServer {
    local_addrs: Vec<SocketAddr>,
    upstreams: Vec<SocketAddr>,
    netconfig: Arc<dyn NetworkConfigurator>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DnsServer {
    /// Start using the system's current resolvers as upstreams
    pub async fn start(
        settings: DnsSettings,
        resolver: Arc<InterceptTable>,
        netconfig: Arc<dyn NetworkConfigurator>,
    ) -> io::Result<Self> {
        let mut resolvers = match netconfig.upstream_resolvers().await {
            Ok(resolvers) => resolvers,
            Err(e) => {
                tracing::warn!("could not read upstream DNS servers: {}", e);
                Vec::new()
            }
        };
        if resolvers.is_empty() {
            tracing::info!(
                "no upstream DNS servers reported; using fallback resolvers {:?}",
                settings.fallback_resolvers
            );
            resolvers = settings.fallback_resolvers.clone();
        }

        let upstreams = resolvers
            .into_iter()
            .map(|ip| SocketAddr::new(ip, settings.upstream_port))
            .collect();
        Self::start_with_upstreams(settings, upstreams, resolver, netconfig).await
    }

    /// Start with an explicit list of upstream resolvers
    pub async fn start_with_upstreams(
        settings: DnsSettings,
        upstreams: Vec<SocketAddr>,
        resolver: Arc<InterceptTable>,
        netconfig: Arc<dyn NetworkConfigurator>,
    ) -> io::Result<Self> {
        match netconfig.connection_specific_domains().await {
            Ok(domains) => {
                tracing::debug!("connection specific DNS suffixes: {:?}", domains);
                resolver.set_suffixes(domains);
            }
            Err(e) => tracing::warn!("could not read connection specific DNS suffixes: {}", e),
        }

        let mut listeners = Vec::with_capacity(settings.listen.len());
        let mut local_addrs = Vec::with_capacity(settings.listen.len());
        for addr in &settings.listen {
            let socket = UdpSocket::bind(addr).await?;
            local_addrs.push(socket.local_addr()?);
            listeners.push(Arc::new(socket));
        }

        let mut connections = Vec::with_capacity(upstreams.len());
        let mut connected = Vec::with_capacity(upstreams.len());
        for upstream in &upstreams {
            match connect_upstream(*upstream).await {
                Ok(socket) => {
                    connections.push(Arc::new(socket));
                    connected.push(*upstream);
                }
                Err(e) => tracing::warn!("skipping upstream {}: {}", upstream, e),
            }
        }

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (query_tx, query_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(QUEUE_CAPACITY);

        for (index, socket) in listeners.iter().enumerate() {
            tasks.spawn(run_listener(
                index,
                Arc::clone(socket),
                query_tx.clone(),
                cancel.clone(),
            ));
        }
        for socket in &connections {
            tasks.spawn(run_upstream_reader(
                Arc::clone(socket),
                response_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(query_tx);
        drop(response_tx);

        let processor = QueryProcessor {
            resolver,
            listeners,
            upstreams: connections,
            pending: PendingTable::new(),
            proxy_timeout: settings.proxy_timeout,
        };
        tasks.spawn(processor.run(
            query_rx,
            response_rx,
            settings.sweep_interval,
            cancel.clone(),
        ));
        tasks.close();

        let bound: Vec<IpAddr> = local_addrs.iter().map(|addr| addr.ip()).collect();
        if let Err(e) = netconfig.set_resolvers(&bound).await {
            tracing::warn!("could not install {:?} as system DNS servers: {}", bound, e);
        }

        tracing::info!(
            "DNS resolver listening on {:?}, proxying to {:?}",
            local_addrs,
            connected
        );

        Ok(Self {
            local_addrs,
            upstreams: connected,
            netconfig,
            cancel,
            tasks,
        })
    }

    /// Bound listener addresses
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Upstream resolvers queries are proxied to
    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    /// Stop every DNS task and restore the system's DNS configuration
    pub async fn shutdown(self) {
        tracing::info!("shutting down DNS resolver");
        self.cancel.cancel();
        self.tasks.wait().await;

        if let Err(e) = self.netconfig.reset_resolvers().await {
            tracing::error!("failed to restore system DNS servers: {}", e);
        }
    }
}

async fn connect_upstream(upstream: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    Ok(socket)
}

struct InboundQuery {
    packet: Vec<u8>,
    peer: SocketAddr,
    listener: usize,
}

async fn run_listener(
    index: usize,
    socket: Arc<UdpSocket>,
    queries: mpsc::Sender<InboundQuery>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("DNS listener {} receive error: {}", index, e);
                    continue;
                }
            },
        };

        let query = InboundQuery {
            packet: buf[..len].to_vec(),
            peer,
            listener: index,
        };
        if queries.send(query).await.is_err() {
            break;
        }
    }
    tracing::debug!("DNS listener {} stopped", index);
}

async fn run_upstream_reader(
    socket: Arc<UdpSocket>,
    responses: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let upstream = socket.peer_addr().ok();
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(len) => len,
                Err(e) => {
                    tracing::debug!("error receiving from upstream {:?}: {}", upstream, e);
                    continue;
                }
            },
        };

        if responses.send(buf[..len].to_vec()).await.is_err() {
            break;
        }
    }
    tracing::debug!("upstream reader for {:?} stopped", upstream);
}

/// Sole owner of the pending-query table
struct QueryProcessor {
    resolver: Arc<InterceptTable>,
    listeners: Vec<Arc<UdpSocket>>,
    upstreams: Vec<Arc<UdpSocket>>,
    pending: PendingTable,
    proxy_timeout: Duration,
}

impl QueryProcessor {
    async fn run(
        mut self,
        mut queries: mpsc::Receiver<InboundQuery>,
        mut responses: mpsc::Receiver<Vec<u8>>,
        sweep_interval: Duration,
        cancel: CancellationToken,
    ) {
        let period = sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(query) = queries.recv() => self.handle_query(query).await,
                Some(response) = responses.recv() => self.handle_response(&response).await,
                _ = sweep.tick() => {
                    let expired = self.pending.sweep(Instant::now());
                    if expired > 0 {
                        tracing::debug!("swept {} expired DNS queries", expired);
                    }
                }
            }
        }
        tracing::debug!(
            "DNS processing stopped with {} queries pending",
            self.pending.len()
        );
    }

    async fn handle_query(&mut self, query: InboundQuery) {
        let request = match Message::from_vec(&query.packet) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("dropping malformed DNS packet from {}: {}", query.peer, e);
                return;
            }
        };
        let Some(question) = request.queries().first().cloned() else {
            tracing::debug!("dropping DNS packet without a question from {}", query.peer);
            return;
        };

        // names we intercept are never proxied, whatever the record type
        match self.resolver.resolve(&question.name().to_string()) {
            Some(ip) => self.answer_locally(&request, &question, ip, &query).await,
            None => self.proxy(&request, &question, query).await,
        }
    }

    async fn answer_locally(
        &self,
        request: &Message,
        question: &Query,
        ip: IpAddr,
        query: &InboundQuery,
    ) {
        tracing::debug!("resolved {} to {}", question.name(), ip);

        let mut reply = Message::new();
        reply.set_header(Header::response_from_request(request.header()));
        reply.set_recursion_available(false);
        reply.set_authoritative(false);
        reply.set_response_code(ResponseCode::Refused);
        reply.add_query(question.clone());

        let rdata = match (question.query_type(), ip) {
            (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A(v4))),
            (RecordType::AAAA, IpAddr::V4(v4)) => Some(RData::AAAA(AAAA(v4.to_ipv6_mapped()))),
            (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA(v6))),
            _ => None,
        };
        if let Some(rdata) = rdata {
            let mut record = Record::from_rdata(question.name().clone(), LOCAL_ANSWER_TTL, rdata);
            record.set_dns_class(question.query_class());
            reply.add_answer(record);
            reply.set_authoritative(true);
            reply.set_response_code(ResponseCode::NoError);
        }

        let bytes = match reply.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("could not encode DNS answer for {}: {}", question.name(), e);
                return;
            }
        };
        if let Some(socket) = self.listeners.get(query.listener) {
            if let Err(e) = socket.send_to(&bytes, query.peer).await {
                tracing::warn!("could not answer DNS query from {}: {}", query.peer, e);
            }
        }
    }

    async fn proxy(&mut self, request: &Message, question: &Query, query: InboundQuery) {
        if self.upstreams.is_empty() {
            tracing::debug!("no upstream resolvers; not proxying {}", question.name());
            return;
        }

        let key = correlation_id(request.id(), u16::from(question.query_type()));
        let packet = query.packet.clone();
        let entry = PendingQuery {
            request: query.packet,
            peer: query.peer,
            listener: query.listener,
            expires_at: Instant::now() + self.proxy_timeout,
        };
        if let Some(previous) = self.pending.insert(key, entry) {
            tracing::debug!(
                "correlation id {:#010x} collided; dropping pending query from {}",
                key,
                previous.peer
            );
        }

        let writes = join_all(self.upstreams.iter().map(|upstream| upstream.send(&packet))).await;
        for (upstream, result) in self.upstreams.iter().zip(writes) {
            if let Err(e) = result {
                tracing::warn!("failed to proxy DNS to {:?}: {}", upstream.peer_addr().ok(), e);
            }
        }
    }

    async fn handle_response(&mut self, packet: &[u8]) {
        let reply = match Message::from_vec(packet) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("dropping malformed upstream DNS response: {}", e);
                return;
            }
        };
        let Some(question) = reply.queries().first() else {
            tracing::debug!("dropping upstream DNS response without a question");
            return;
        };

        let key = correlation_id(reply.id(), u16::from(question.query_type()));
        match self.pending.take(key) {
            Some(pending) => {
                if let Some(socket) = self.listeners.get(pending.listener) {
                    if let Err(e) = socket.send_to(packet, pending.peer).await {
                        tracing::warn!("could not relay DNS answer to {}: {}", pending.peer, e);
                    }
                }
            }
            None => tracing::debug!(
                "matching request was not found for {} {}",
                question.query_type(),
                question.name()
            ),
        }
    }
}
