//! RPC routing between local handlers and remote cluster members
//!
//! A call names a `Service.Method` route. The router first consults the local
//! [`Components`]; only when the service is not hosted here does it look at
//! the cluster:
//!
//! 1. collect the members advertising the service (sorted by node id),
//! 2. let the [`RouteStrategy`] pick one,
//! 3. forward the call over a cached [`NodeLink`] to that member, waiting at
//!    most the call timeout (connection setup included).
//!
//! Calls arriving from other nodes execute against proxy sessions, one per
//! origin session, so remote handlers see the same [`Session`] API as local
//! ones. Each proxy drains its calls sequentially on its own task, which
//! keeps the origin's packet order intact.
//!
//! Failures are never retried here. Route errors and timeouts go back to the
//! caller as typed errors; handler panics are contained at the call boundary.

use crate::cluster::link::{LinkHandler, NodeLink};
use crate::cluster::member::MemberRegistry;
use crate::component::{split_route, Components, Handler, HandlerError};
use crate::config::DEFAULT_CALL_TIMEOUT;
use crate::error::{Error, Result};
use crate::session::{Outbound, RemoteOrigin, Session, SessionRegistry};
use crate::utils::{lock, panic_message};
use bytes::Bytes;
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{frame_type, MemberInfo, NodeMessage, PacketType, RemoteCall, DEFAULT_MAX_PACKET_SIZE};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Picks the member that serves a forwarded call.
///
/// `candidates` is never empty and is sorted by node id. Returning `None`, or
/// an index out of range, fails the call with a route error.
pub trait RouteStrategy: Send + Sync + 'static {
    fn select(&self, service: &str, origin: &Session, candidates: &[MemberInfo]) -> Option<usize>;
}

impl<F> RouteStrategy for F
where
    F: Fn(&str, &Session, &[MemberInfo]) -> Option<usize> + Send + Sync + 'static,
{
    fn select(&self, service: &str, origin: &Session, candidates: &[MemberInfo]) -> Option<usize> {
        self(service, origin, candidates)
    }
}

/// Always the member with the lowest node id.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstAvailable;

impl RouteStrategy for FirstAvailable {
    fn select(&self, _service: &str, _origin: &Session, candidates: &[MemberInfo]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

/// Shards by the origin's bound uid, so one identity keeps landing on the
/// same member while membership is stable. Unbound sessions shard by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct UidHash;

impl RouteStrategy for UidHash {
    fn select(&self, _service: &str, origin: &Session, candidates: &[MemberInfo]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let key = match origin.uid() {
            uid if uid > 0 => uid as u64,
            _ => origin.id(),
        };
        Some((key % candidates.len() as u64) as usize)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomMember;

impl RouteStrategy for RandomMember {
    fn select(&self, _service: &str, _origin: &Session, candidates: &[MemberInfo]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(rand::thread_rng().gen_range(0..candidates.len()))
        }
    }
}

pub type SessionHook = Arc<dyn Fn(&Session) + Send + Sync>;

struct Proxy {
    session: Arc<Session>,
    link: Arc<NodeLink>,
    queue: mpsc::UnboundedSender<(Arc<NodeLink>, RemoteCall)>,
}

/// Outbound path of a proxy session: frames travel back to the origin node,
/// which writes them to the real connection.
struct RelayOutbound {
    link: Arc<NodeLink>,
    session_id: u64,
}

impl Outbound for RelayOutbound {
    fn send(&self, frame: Bytes) -> Result<()> {
        self.link.send(&NodeMessage::Push {
            session_id: self.session_id,
            frame: frame.to_vec(),
        })
    }

    // The origin connection belongs to the origin node.
    fn close(&self) {}
}

/// Link handler for links the router dials itself.
struct ForwardLinks {
    router: Weak<Router>,
}

impl LinkHandler for ForwardLinks {
    fn on_message(&self, link: &Arc<NodeLink>, message: NodeMessage) {
        if let Some(router) = self.router.upgrade() {
            router.handle_link_message(link, message);
        }
    }

    fn on_closed(&self, link: &Arc<NodeLink>) {
        if let Some(router) = self.router.upgrade() {
            router.link_closed(link);
        }
    }
}

pub struct RouterBuilder {
    node_id: u64,
    components: Arc<Components>,
    members: Arc<MemberRegistry>,
    sessions: Arc<SessionRegistry>,
    strategy: Arc<dyn RouteStrategy>,
    call_timeout: Duration,
    max_packet_size: usize,
    debug: bool,
    session_hook: Option<SessionHook>,
}

impl RouterBuilder {
    pub fn node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn components(mut self, components: Arc<Components>) -> Self {
        self.components = components;
        self
    }

    pub fn members(mut self, members: Arc<MemberRegistry>) -> Self {
        self.members = members;
        self
    }

    pub fn sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn RouteStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Hook attached to every session created through this router.
    pub fn on_session_closed(mut self, hook: SessionHook) -> Self {
        self.session_hook = Some(hook);
        self
    }

    pub fn build(self) -> Arc<Router> {
        Arc::new_cyclic(|me| Router {
            me: me.clone(),
            node_id: self.node_id,
            components: self.components,
            members: self.members,
            sessions: self.sessions,
            strategy: self.strategy,
            call_timeout: self.call_timeout,
            max_packet_size: self.max_packet_size,
            debug: self.debug,
            session_hook: self.session_hook,
            links: Mutex::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            proxy_ids: Mutex::new(HashMap::new()),
            forwarded: Mutex::new(HashMap::new()),
            hooked: Mutex::new(HashSet::new()),
        })
    }
}

pub struct Router {
    me: Weak<Router>,
    node_id: u64,
    components: Arc<Components>,
    members: Arc<MemberRegistry>,
    sessions: Arc<SessionRegistry>,
    strategy: Arc<dyn RouteStrategy>,
    call_timeout: Duration,
    max_packet_size: usize,
    debug: bool,
    session_hook: Option<SessionHook>,
    /// Links this router dialed, keyed by member node id.
    links: Mutex<HashMap<u64, Arc<NodeLink>>>,
    proxies: Mutex<HashMap<RemoteOrigin, Proxy>>,
    /// Local proxy session id -> origin, for relaying pushes to proxies.
    proxy_ids: Mutex<HashMap<u64, RemoteOrigin>>,
    /// Local session id -> nodes that received calls from it.
    forwarded: Mutex<HashMap<u64, HashSet<u64>>>,
    /// Local sessions whose close callback is already registered.
    hooked: Mutex<HashSet<u64>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            node_id: 0,
            components: Arc::new(Components::new()),
            members: Arc::new(MemberRegistry::new()),
            sessions: Arc::new(SessionRegistry::new()),
            strategy: Arc::new(FirstAvailable),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            debug: false,
            session_hook: None,
        }
    }

    /// A router with no components and no cluster, for sessions that only
    /// ever push or respond.
    pub fn standalone() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn components(&self) -> &Arc<Components> {
        &self.components
    }

    pub fn members(&self) -> &Arc<MemberRegistry> {
        &self.members
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn proxy_count(&self) -> usize {
        lock(&self.proxies).len()
    }

    /// Handler for links dialed by or to this router that carry calls.
    pub fn link_handler(&self) -> Arc<dyn LinkHandler> {
        Arc::new(ForwardLinks {
            router: self.me.clone(),
        })
    }

    pub(crate) fn attach_hooks(&self, session: &Session) {
        if let Some(hook) = &self.session_hook {
            let hook = Arc::clone(hook);
            session.on_closed(move |s| hook(s));
        }
    }

    /// Routes a call issued with `session` as origin. A local fire-and-forget
    /// call is handed to its own task and returns immediately.
    pub async fn route_call(
        &self,
        session: &Arc<Session>,
        route: &str,
        payload: Vec<u8>,
        wants_response: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.route(session, route, payload, wants_response, true).await
    }

    /// Routes a packet from a client connection. Local handlers are awaited
    /// even for notifies so the connection dispatches strictly in order.
    pub(crate) async fn serve(
        &self,
        session: &Arc<Session>,
        route: &str,
        payload: Vec<u8>,
        wants_response: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.route(session, route, payload, wants_response, false).await
    }

    async fn route(
        &self,
        session: &Arc<Session>,
        route: &str,
        payload: Vec<u8>,
        wants_response: bool,
        detach_local: bool,
    ) -> Result<Option<Vec<u8>>> {
        let (service, _) = split_route(route)?;

        if let Some(handler) = self.components.resolve_local(route) {
            if self.debug {
                debug!("Dispatching {} for session {}", route, session.id());
            }
            if detach_local && !wants_response {
                let session = Arc::clone(session);
                let route = route.to_string();
                tokio::spawn(async move {
                    if let Err(e) = invoke(handler, session, &route, payload).await {
                        warn!("Notify {} failed: {}", route, e);
                    }
                });
                return Ok(None);
            }
            return invoke(handler, Arc::clone(session), route, payload).await;
        }

        self.forward(session, service, route, payload, wants_response)
            .await
    }

    /// Executes `route` against a local handler only.
    pub async fn dispatch_local(
        &self,
        session: &Arc<Session>,
        route: &str,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let (service, _) = split_route(route)?;
        let handler = self
            .components
            .resolve_local(route)
            .ok_or_else(|| Error::Route(service.to_string()))?;
        if self.debug {
            debug!("Dispatching {} for session {}", route, session.id());
        }
        invoke(handler, Arc::clone(session), route, payload).await
    }

    async fn forward(
        &self,
        session: &Arc<Session>,
        service: &str,
        route: &str,
        payload: Vec<u8>,
        wants_response: bool,
    ) -> Result<Option<Vec<u8>>> {
        let candidates = self.members.providers(service, self.node_id);
        if candidates.is_empty() {
            return Err(Error::Route(service.to_string()));
        }
        let member = self
            .strategy
            .select(service, session, &candidates)
            .and_then(|index| candidates.get(index))
            .ok_or_else(|| Error::Route(service.to_string()))?;

        if self.debug {
            debug!("Forwarding {} from session {} to {}", route, session.id(), member);
        }

        let call = RemoteCall {
            call_id: 0,
            origin_node: self.node_id,
            session_id: session.id(),
            uid: session.uid(),
            mid: session.last_mid(),
            route: route.to_string(),
            payload,
            wants_response,
        };

        let started = Instant::now();
        let link = match tokio::time::timeout(self.call_timeout, self.link_to(member)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(self.unreachable(member, route, e)),
            Err(_) => return Err(self.timed_out(route)),
        };
        self.track_forward(session, member.node_id);

        let remaining = self.call_timeout.saturating_sub(started.elapsed());
        match link.call(call, remaining).await {
            Err(Error::Timeout { .. }) => Err(self.timed_out(route)),
            Err(e @ (Error::LinkClosed(_) | Error::Transport(_))) => {
                Err(self.unreachable(member, route, e))
            }
            other => other,
        }
    }

    fn timed_out(&self, route: &str) -> Error {
        Error::Timeout {
            route: route.to_string(),
            timeout: self.call_timeout,
        }
    }

    /// A member that cannot be dialed or drops the link before answering is
    /// reported like one that never answered.
    fn unreachable(&self, member: &MemberInfo, route: &str, cause: Error) -> Error {
        warn!("Member {} unreachable for {}: {}", member, route, cause);
        self.timed_out(route)
    }

    async fn link_to(&self, member: &MemberInfo) -> Result<Arc<NodeLink>> {
        let cached = lock(&self.links).get(&member.node_id).cloned();
        if let Some(link) = cached {
            if !link.is_closed() {
                return Ok(link);
            }
        }

        let link = NodeLink::connect(&member.service_addr, self.link_handler(), self.max_packet_size).await?;
        debug!("Opened link to {}", member);

        let mut links = lock(&self.links);
        match links.get(&member.node_id) {
            Some(existing) if !existing.is_closed() => {
                link.close();
                Ok(Arc::clone(existing))
            }
            _ => {
                links.insert(member.node_id, Arc::clone(&link));
                Ok(link)
            }
        }
    }

    /// Remembers that `session` has state on `node_id`, so its close can be
    /// announced there.
    fn track_forward(&self, session: &Arc<Session>, node_id: u64) {
        lock(&self.forwarded)
            .entry(session.id())
            .or_default()
            .insert(node_id);
        if lock(&self.hooked).insert(session.id()) {
            let router = self.me.clone();
            session.on_closed(move |s| {
                if let Some(router) = router.upgrade() {
                    router.session_closed(s.id());
                }
            });
        }
    }

    fn session_closed(&self, session_id: u64) {
        lock(&self.hooked).remove(&session_id);
        let Some(nodes) = lock(&self.forwarded).remove(&session_id) else {
            return;
        };
        let links = lock(&self.links);
        for node_id in nodes {
            if let Some(link) = links.get(&node_id) {
                let message = NodeMessage::SessionClosed {
                    origin_node: self.node_id,
                    session_id,
                };
                if let Err(e) = link.send(&message) {
                    debug!("Could not announce close of session {} to node {}: {}", session_id, node_id, e);
                }
            }
        }
    }

    /// Handles the call-carrying subset of the node protocol.
    pub fn handle_link_message(&self, link: &Arc<NodeLink>, message: NodeMessage) {
        match message {
            NodeMessage::Call(call) => self.accept_call(link, call),
            NodeMessage::Push { session_id, frame } => self.relay_push(session_id, frame),
            NodeMessage::SessionClosed {
                origin_node,
                session_id,
            } => self.close_proxy(RemoteOrigin {
                node_id: origin_node,
                session_id,
            }),
            other => debug!("Ignoring {:?} from {}", other, link.peer()),
        }
    }

    fn accept_call(&self, link: &Arc<NodeLink>, call: RemoteCall) {
        let origin = RemoteOrigin {
            node_id: call.origin_node,
            session_id: call.session_id,
        };

        let queue = {
            let mut proxies = lock(&self.proxies);
            match proxies.get(&origin) {
                Some(proxy) if !proxy.session.is_closed() => Some(proxy.queue.clone()),
                _ => match self.spawn_proxy(link, origin, call.uid) {
                    Some(proxy) => {
                        let queue = proxy.queue.clone();
                        proxies.insert(origin, proxy);
                        Some(queue)
                    }
                    None => None,
                },
            }
        };

        match queue {
            Some(queue) => {
                if queue.send((Arc::clone(link), call)).is_err() {
                    warn!("Proxy for session {} of node {} is gone", origin.session_id, origin.node_id);
                }
            }
            None => warn!("Dropping call {} from node {}: router is shutting down", call.route, origin.node_id),
        }
    }

    fn spawn_proxy(&self, link: &Arc<NodeLink>, origin: RemoteOrigin, uid: i64) -> Option<Proxy> {
        let router = self.me.upgrade()?;
        let id = self.sessions.next_id();
        let outbound = Arc::new(RelayOutbound {
            link: Arc::clone(link),
            session_id: origin.session_id,
        });
        let session = Session::proxy(id, outbound, Arc::clone(&router), origin, uid);
        self.attach_hooks(&session);
        lock(&self.proxy_ids).insert(id, origin);

        let weak = self.me.clone();
        session.on_closed(move |s| {
            if let Some(router) = weak.upgrade() {
                router.forget_proxy(origin, s.id());
            }
        });

        debug!(
            "Created proxy session {} for session {} of node {}",
            id, origin.session_id, origin.node_id
        );

        let (queue, mut calls) = mpsc::unbounded_channel::<(Arc<NodeLink>, RemoteCall)>();
        let worker = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some((link, call)) = calls.recv().await {
                router.execute_remote(&worker, &link, call).await;
            }
        });

        Some(Proxy {
            session,
            link: Arc::clone(link),
            queue,
        })
    }

    async fn execute_remote(&self, proxy: &Arc<Session>, link: &Arc<NodeLink>, call: RemoteCall) {
        let result = if proxy.is_closed() {
            Err(Error::SessionClosed(proxy.id()))
        } else {
            if call.uid > 0 && !proxy.is_bound() {
                if let Err(e) = proxy.bind(call.uid) {
                    debug!("Proxy {} kept its binding: {}", proxy.id(), e);
                }
            }
            proxy.set_last_mid(call.mid);
            self.dispatch_local(proxy, &call.route, call.payload).await
        };

        if call.wants_response {
            let reply = NodeMessage::Reply {
                call_id: call.call_id,
                result: result.map_err(|e| e.to_remote()),
            };
            if let Err(e) = link.send(&reply) {
                debug!("Reply for {} to {} lost: {}", call.route, link.peer(), e);
            }
        } else if let Err(e) = result {
            warn!("Notify {} from node {} failed: {}", call.route, call.origin_node, e);
        }
    }

    fn forget_proxy(&self, origin: RemoteOrigin, id: u64) {
        lock(&self.proxy_ids).remove(&id);
        let mut proxies = lock(&self.proxies);
        if proxies.get(&origin).map(|p| p.session.id()) == Some(id) {
            proxies.remove(&origin);
        }
    }

    fn close_proxy(&self, origin: RemoteOrigin) {
        let proxy = lock(&self.proxies).remove(&origin);
        if let Some(proxy) = proxy {
            debug!("Origin session {} of node {} closed", origin.session_id, origin.node_id);
            proxy.session.close();
        }
    }

    fn close_proxies_where<F>(&self, predicate: F)
    where
        F: Fn(&RemoteOrigin, &Proxy) -> bool,
    {
        let closing: Vec<Arc<Session>> = {
            let mut proxies = lock(&self.proxies);
            let keys: Vec<RemoteOrigin> = proxies
                .iter()
                .filter(|(origin, proxy)| predicate(origin, proxy))
                .map(|(origin, _)| *origin)
                .collect();
            keys.into_iter()
                .filter_map(|origin| proxies.remove(&origin))
                .map(|proxy| proxy.session)
                .collect()
        };
        for session in closing {
            session.close();
        }
    }

    /// Finds a live session by id: a client session of this node or a proxy.
    pub fn find_session(&self, session_id: u64) -> Option<Arc<Session>> {
        if let Some(session) = self.sessions.get(session_id) {
            return Some(session);
        }
        let origin = lock(&self.proxy_ids).get(&session_id).copied()?;
        lock(&self.proxies)
            .get(&origin)
            .map(|proxy| Arc::clone(&proxy.session))
    }

    fn relay_push(&self, session_id: u64, frame: Vec<u8>) {
        let Some(session) = self.find_session(session_id) else {
            debug!("Push for unknown session {} dropped", session_id);
            return;
        };
        let kick = frame_type(&frame) == Some(PacketType::Kick);
        if let Err(e) = session.send_frame(Bytes::from(frame)) {
            debug!("Relay to session {} failed: {}", session_id, e);
        }
        if kick {
            session.close();
        }
    }

    /// Drops everything tied to a member that left the cluster: the cached
    /// link and the proxies of its sessions.
    pub fn invalidate(&self, node_id: u64) {
        let link = lock(&self.links).remove(&node_id);
        if let Some(link) = link {
            link.close();
        }
        lock(&self.forwarded).retain(|_, nodes| {
            nodes.remove(&node_id);
            !nodes.is_empty()
        });
        self.close_proxies_where(|origin, _| origin.node_id == node_id);
        info!("Routing state for node {} invalidated", node_id);
    }

    /// Forgets a link that went down and closes the proxies fed by it.
    pub fn link_closed(&self, link: &Arc<NodeLink>) {
        lock(&self.links).retain(|_, cached| !Arc::ptr_eq(cached, link));
        self.close_proxies_where(|_, proxy| Arc::ptr_eq(&proxy.link, link));
    }

    /// Closes every dialed link and every proxy session.
    pub fn close_links(&self) {
        let links: Vec<Arc<NodeLink>> = lock(&self.links).drain().map(|(_, link)| link).collect();
        for link in links {
            link.close();
        }
        self.close_proxies_where(|_, _| true);
    }
}

/// Runs one handler invocation on its own task so that a panic surfaces as
/// a `JoinError` instead of unwinding through the caller.
async fn invoke(
    handler: Handler,
    session: Arc<Session>,
    route: &str,
    payload: Vec<u8>,
) -> Result<Option<Vec<u8>>> {
    let future = match catch_unwind(AssertUnwindSafe(|| handler(session, payload))) {
        Ok(future) => future,
        Err(panic) => return Err(handler_panic(route, panic_message(panic.as_ref()))),
    };

    match tokio::spawn(future).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(HandlerError(message))) => Err(Error::Handler {
            route: route.to_string(),
            message,
        }),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            Err(handler_panic(route, panic_message(panic.as_ref())))
        }
        Err(_) => Err(Error::Handler {
            route: route.to_string(),
            message: "handler task was cancelled".into(),
        }),
    }
}

fn handler_panic(route: &str, message: String) -> Error {
    error!("Handler for {} panicked: {}", route, message);
    Error::HandlerPanic {
        route: route.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::session::MemoryOutbound;
    use shared::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn member(node_id: u64, addr: &str, services: &[&str]) -> MemberInfo {
        MemberInfo {
            node_id,
            service_addr: addr.to_string(),
            client_addr: None,
            is_master: false,
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn session_on(router: &Arc<Router>, id: u64) -> (Arc<Session>, Arc<MemoryOutbound>) {
        let outbound = MemoryOutbound::new();
        let session = Session::new(id, outbound.clone(), Arc::clone(router));
        session.activate();
        router.sessions().insert(Arc::clone(&session));
        (session, outbound)
    }

    fn echo_components() -> Components {
        let mut components = Components::new();
        components
            .register(
                Component::new("Room")
                    .method("Join", |session, payload| async move {
                        let mut reply = format!("uid={} ", session.uid()).into_bytes();
                        reply.extend(payload);
                        Ok(Some(reply))
                    })
                    .method("Announce", |session, payload| async move {
                        session.push("onAnnounce", payload)?;
                        Ok(None)
                    })
                    .method("Fail", |_, _| async { Err(HandlerError::from("room is full")) })
                    .method("Crash", |_, _| async {
                        let seats: Vec<u8> = Vec::new();
                        Ok(Some(vec![seats[3]]))
                    }),
            )
            .unwrap();
        components
    }

    /// Serves `router` on a loopback listener and returns its address.
    async fn serve(router: &Arc<Router>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handler = router.link_handler();
        let max = router.max_packet_size();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                NodeLink::spawn(stream, peer.to_string(), Arc::clone(&handler), max);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_local_call() {
        let router = Router::builder()
            .components(Arc::new(echo_components()))
            .build();
        let (session, _) = session_on(&router, 1);
        session.bind(7).unwrap();

        let reply = session.call("Room.Join", b"hi".to_vec(), true).await.unwrap();
        assert_eq!(reply, Some(b"uid=7 hi".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_service_is_route_error() {
        let router = Router::standalone();
        let (session, _) = session_on(&router, 1);

        match session.call("Room.Join", Vec::new(), true).await {
            Err(Error::Route(service)) => assert_eq!(service, "Room"),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            session.call("NoDot", Vec::new(), true).await,
            Err(Error::InvalidRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let router = Router::builder()
            .components(Arc::new(echo_components()))
            .build();
        let (session, _) = session_on(&router, 1);

        match session.call("Room.Crash", Vec::new(), true).await {
            Err(Error::HandlerPanic { route, .. }) => assert_eq!(route, "Room.Crash"),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(session.is_active());
        assert!(session.call("Room.Join", Vec::new(), true).await.is_ok());
    }

    #[tokio::test]
    async fn test_handler_error_is_typed() {
        let router = Router::builder()
            .components(Arc::new(echo_components()))
            .build();
        let (session, _) = session_on(&router, 1);

        match session.call("Room.Fail", Vec::new(), true).await {
            Err(Error::Handler { message, .. }) => assert_eq!(message, "room is full"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_notify_returns_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let mut components = Components::new();
        components
            .register(Component::new("Stats").method("Hit", move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }))
            .unwrap();
        let router = Router::builder().components(Arc::new(components)).build();
        let (session, _) = session_on(&router, 1);

        assert_eq!(session.call("Stats.Hit", Vec::new(), false).await.unwrap(), None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builtin_strategies() {
        let router = Router::standalone();
        let candidates = vec![
            member(2, "a", &["Room"]),
            member(5, "b", &["Room"]),
            member(9, "c", &["Room"]),
        ];
        let session = Session::new(4, MemoryOutbound::new(), Arc::clone(&router));

        assert_eq!(FirstAvailable.select("Room", &session, &candidates), Some(0));
        assert_eq!(FirstAvailable.select("Room", &session, &[]), None);

        assert_eq!(UidHash.select("Room", &session, &candidates), Some(1));
        session.activate();
        session.bind(1001).unwrap();
        let first = UidHash.select("Room", &session, &candidates);
        for _ in 0..10 {
            assert_eq!(UidHash.select("Room", &session, &candidates), first);
        }
        assert_eq!(first, Some((1001 % 3) as usize));

        for _ in 0..20 {
            let index = RandomMember.select("Room", &session, &candidates).unwrap();
            assert!(index < candidates.len());
        }
    }

    #[tokio::test]
    async fn test_forwarded_call_reaches_member() {
        let backend = Router::builder()
            .node_id(2)
            .components(Arc::new(echo_components()))
            .build();
        let addr = serve(&backend).await;

        let gate = Router::builder().node_id(1).build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);
        session.bind(42).unwrap();

        let reply = session.call("Room.Join", b"hello".to_vec(), true).await.unwrap();
        assert_eq!(reply, Some(b"uid=42 hello".to_vec()));
        assert_eq!(backend.proxy_count(), 1);

        match session.call("Room.Fail", Vec::new(), true).await {
            Err(Error::Handler { message, .. }) => assert_eq!(message, "room is full"),
            other => panic!("unexpected result {other:?}"),
        }
        match session.call("Room.Missing", Vec::new(), true).await {
            Err(Error::Route(service)) => assert_eq!(service, "Room"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_push_is_relayed_to_origin() {
        let backend = Router::builder()
            .node_id(2)
            .components(Arc::new(echo_components()))
            .build();
        let addr = serve(&backend).await;

        let gate = Router::builder().node_id(1).build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, outbound) = session_on(&gate, 1);

        let reply = session.call("Room.Announce", b"news".to_vec(), true).await.unwrap();
        assert_eq!(reply, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let messages = outbound.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Push);
        assert_eq!(messages[0].route, "onAnnounce");
        assert_eq!(messages[0].data, b"news");
    }

    #[tokio::test]
    async fn test_origin_close_closes_proxy() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let backend = Router::builder()
            .node_id(2)
            .components(Arc::new(echo_components()))
            .on_session_closed(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        let addr = serve(&backend).await;

        let gate = Router::builder().node_id(1).build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);
        session.call("Room.Join", Vec::new(), true).await.unwrap();
        assert_eq!(backend.proxy_count(), 1);

        session.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.proxy_count(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strategy_error_and_custom_strategy() {
        let backend = Router::builder()
            .node_id(3)
            .components(Arc::new(echo_components()))
            .build();
        let addr = serve(&backend).await;

        let picks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&picks);
        let gate = Router::builder()
            .node_id(1)
            .strategy(Arc::new(move |service: &str, _: &Session, candidates: &[MemberInfo]| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(service, "Room");
                candidates.iter().position(|m| m.node_id == 3)
            }))
            .build();
        gate.members().add(member(2, "127.0.0.1:1", &["Room"]));
        gate.members().add(member(3, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);

        assert!(session.call("Room.Join", Vec::new(), true).await.is_ok());
        assert_eq!(picks.load(Ordering::SeqCst), 1);

        let lost = Router::builder()
            .node_id(1)
            .strategy(Arc::new(|_: &str, _: &Session, _: &[MemberInfo]| Some(99)))
            .build();
        lost.members().add(member(3, &addr, &["Room"]));
        let (session, _) = session_on(&lost, 1);
        assert!(matches!(
            session.call("Room.Join", Vec::new(), true).await,
            Err(Error::Route(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_member_times_out_and_session_survives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut components = Components::new();
        components
            .register(Component::new("Echo").method("Say", |_, p| async move { Ok(Some(p)) }))
            .unwrap();
        let gate = Router::builder()
            .node_id(1)
            .components(Arc::new(components))
            .call_timeout(Duration::from_millis(100))
            .build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);

        let started = Instant::now();
        match session.call("Room.Join", Vec::new(), true).await {
            Err(Error::Timeout { route, timeout }) => {
                assert_eq!(route, "Room.Join");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(100));

        assert!(session.is_active());
        let reply = session.call("Echo.Say", b"still here".to_vec(), true).await.unwrap();
        assert_eq!(reply, Some(b"still here".to_vec()));
    }

    #[tokio::test]
    async fn test_invalidate_drops_link() {
        let backend = Router::builder()
            .node_id(2)
            .components(Arc::new(echo_components()))
            .build();
        let addr = serve(&backend).await;

        let gate = Router::builder().node_id(1).build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);
        session.call("Room.Join", Vec::new(), true).await.unwrap();
        assert_eq!(lock(&gate.links).len(), 1);

        gate.members().remove(2);
        gate.invalidate(2);
        assert!(lock(&gate.links).is_empty());
        assert!(matches!(
            session.call("Room.Join", Vec::new(), true).await,
            Err(Error::Route(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_member_times_out() {
        let gate = Router::builder()
            .node_id(1)
            .call_timeout(Duration::from_millis(100))
            .build();
        gate.members().add(member(2, "127.0.0.1:1", &["Room"]));
        let (session, _) = session_on(&gate, 1);

        match session.call("Room.Join", Vec::new(), true).await {
            Err(Error::Timeout { route, timeout }) => {
                assert_eq!(route, "Room.Join");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(session.is_active());
        assert!(lock(&gate.links).is_empty());
    }

    #[tokio::test]
    async fn test_link_dropped_before_reply_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let gate = Router::builder()
            .node_id(1)
            .call_timeout(Duration::from_millis(500))
            .build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);

        assert!(matches!(
            session.call("Room.Join", Vec::new(), true).await,
            Err(Error::Timeout { .. })
        ));
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_invalidate_clears_forward_tracking() {
        let backend = Router::builder()
            .node_id(2)
            .components(Arc::new(echo_components()))
            .build();
        let addr = serve(&backend).await;

        let gate = Router::builder().node_id(1).build();
        gate.members().add(member(2, &addr, &["Room"]));
        let (session, _) = session_on(&gate, 1);
        session.call("Room.Join", Vec::new(), true).await.unwrap();
        assert_eq!(lock(&gate.forwarded).len(), 1);

        gate.invalidate(2);
        assert!(lock(&gate.forwarded).is_empty());

        session.call("Room.Join", Vec::new(), true).await.unwrap();
        assert_eq!(lock(&gate.forwarded).len(), 1);
        assert_eq!(lock(&gate.hooked).len(), 1);

        session.close();
        assert!(lock(&gate.forwarded).is_empty());
        assert!(lock(&gate.hooked).is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.proxy_count(), 0);
    }
}
