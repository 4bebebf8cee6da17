//! Node startup, membership and shutdown
//!
//! A node plays one of three roles, decided by its [`NodeConfig`]:
//!
//! - **master**: the membership authority. Accepts registrations, hands out
//!   membership snapshots, streams additions and removals to every
//!   registered node, and drops members whose heartbeats stop.
//! - **service node**: registers with the master, retrying at a fixed
//!   interval until it succeeds, and registers again whenever the master
//!   link drops. Gates are service nodes that also accept clients.
//! - **singleton**: no master at all. Clients connect to the service address
//!   and every route resolves locally.
//!
//! All per-node registries (sessions, members, links) hang off the [`Node`]
//! and are torn down by [`Node::shutdown`].

use crate::cluster::link::{LinkHandler, NodeLink};
use crate::cluster::member::MemberRegistry;
use crate::component::{Component, Components};
use crate::config::NodeConfig;
use crate::connection::serve_client;
use crate::error::{Error, Result};
use crate::router::{FirstAvailable, RouteStrategy, Router, SessionHook};
use crate::scheduler::Scheduler;
use crate::session::{Session, SessionRegistry};
use crate::utils::lock;
use log::{debug, info, warn};
use shared::{MemberInfo, NodeMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type MemberHook = Arc<dyn Fn(&MemberInfo) + Send + Sync>;

/// Collects components and hooks before a node starts.
pub struct NodeBuilder {
    config: NodeConfig,
    components: Components,
    strategy: Arc<dyn RouteStrategy>,
    on_unregister: Vec<MemberHook>,
    on_session_closed: Option<SessionHook>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            components: Components::new(),
            strategy: Arc::new(FirstAvailable),
            on_unregister: Vec::new(),
            on_session_closed: None,
        }
    }

    /// Hosts `component` on this node. Fails on malformed or duplicate names.
    pub fn register(mut self, component: Component) -> Result<Self> {
        self.components.register(component)?;
        Ok(self)
    }

    pub fn route_strategy<S: RouteStrategy>(mut self, strategy: S) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Runs whenever a member leaves the cluster, on every node that learns
    /// about it.
    pub fn on_unregister<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MemberInfo) + Send + Sync + 'static,
    {
        self.on_unregister.push(Arc::new(hook));
        self
    }

    /// Runs when any session of this node closes, client or proxy.
    pub fn on_session_closed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.on_session_closed = Some(Arc::new(hook));
        self
    }

    /// Binds the listeners and starts the node's background work. Bad
    /// configuration and bind failures are fatal; an unreachable master is
    /// not.
    pub async fn startup(self) -> Result<Node> {
        let mut config = self.config;
        config.validate()?;

        let service_listener = if config.is_singleton() {
            None
        } else {
            Some(bind(&config.service_addr).await?)
        };
        let client_listener = match config.effective_client_addr() {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        let service_addr = match &service_listener {
            Some(listener) => listener.local_addr()?.to_string(),
            None => config.service_addr.clone(),
        };
        let client_addr = match &client_listener {
            Some(listener) => Some(listener.local_addr()?.to_string()),
            None => None,
        };
        let service_addr = match (&service_listener, &client_addr) {
            (None, Some(addr)) => addr.clone(),
            _ => service_addr,
        };

        let info = MemberInfo {
            node_id: config.node_id,
            service_addr,
            client_addr: client_addr.clone(),
            is_master: config.is_master,
            services: self.components.services(),
        };

        let members = Arc::new(MemberRegistry::new());
        let sessions = Arc::new(SessionRegistry::new());
        let mut router = Router::builder()
            .node_id(config.node_id)
            .components(Arc::new(self.components))
            .members(Arc::clone(&members))
            .sessions(Arc::clone(&sessions))
            .strategy(self.strategy)
            .call_timeout(config.call_timeout)
            .max_packet_size(config.max_packet_size)
            .debug(config.debug);
        if let Some(hook) = self.on_session_closed {
            router = router.on_session_closed(hook);
        }
        let router = router.build();

        if config.master_addr.is_none() {
            members.add(info.clone());
        }

        let (registered_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Shared {
            config,
            info,
            router,
            members,
            sessions,
            scheduler: Scheduler::start(),
            on_unregister: self.on_unregister,
            registered: Mutex::new(HashMap::new()),
            accepted: Mutex::new(Vec::new()),
            master_link: Mutex::new(None),
            registered_tx,
            shutdown_tx,
        });

        let mut tasks = Vec::new();
        if let Some(listener) = service_listener {
            tasks.push(spawn_link_listener(listener, &inner));
        }
        if let Some(listener) = client_listener {
            tasks.push(spawn_client_listener(listener, &inner));
        }
        if let Some(master_addr) = inner.config.master_addr.clone() {
            tasks.push(tokio::spawn(register_loop(Arc::clone(&inner), master_addr)));
        }
        schedule_housekeeping(&inner)?;

        let role = if inner.config.is_master {
            "master"
        } else if inner.config.is_singleton() {
            "singleton"
        } else {
            "service node"
        };
        info!("Node {} started as {}: {}", inner.info.node_id, role, inner.info);
        if let Some(addr) = &client_addr {
            info!("Accepting clients on {}", addr);
        }

        Ok(Node {
            inner,
            tasks: Mutex::new(tasks),
        })
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        Error::Config(format!("failed to bind {addr}: {e}"))
    })
}

/// State shared between the node handle, its listeners and its links.
struct Shared {
    config: NodeConfig,
    info: MemberInfo,
    router: Arc<Router>,
    members: Arc<MemberRegistry>,
    sessions: Arc<SessionRegistry>,
    scheduler: Scheduler,
    on_unregister: Vec<MemberHook>,
    /// Master only: node id -> link it registered over.
    registered: Mutex<HashMap<u64, Arc<NodeLink>>>,
    /// Links accepted on the service listener.
    accepted: Mutex<Vec<Arc<NodeLink>>>,
    /// Service nodes only.
    master_link: Mutex<Option<Arc<NodeLink>>>,
    registered_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn handler(self: &Arc<Self>) -> Arc<dyn LinkHandler> {
        Arc::new(NodeHandler {
            node: Arc::downgrade(self),
        })
    }

    fn accept_registration(&self, link: &Arc<NodeLink>, member: MemberInfo) {
        if !self.config.is_master {
            warn!("Ignoring registration of {} on a non-master node", member);
            return;
        }

        let node_id = member.node_id;
        if !self.claim_node_id(node_id, link) {
            warn!("Rejecting {}: node id already registered", member);
            let reason = format!("node id {node_id} is already registered");
            if let Err(e) = link.send(&NodeMessage::RegisterRejected { reason }) {
                debug!("Could not send rejection to {}: {}", link.peer(), e);
            }
            return;
        }

        self.members.add(member.clone());
        let ack = NodeMessage::RegisterAck {
            members: self.members.snapshot(),
        };
        if let Err(e) = link.send(&ack) {
            warn!("Could not acknowledge {}: {}", member, e);
        }
        info!("Member registered: {}", member);
        self.notify_registered(&NodeMessage::MemberAdded { member }, node_id);
    }

    /// Records `link` as the owner of `node_id` unless a live link already
    /// holds it. Check and insert happen under one guard.
    fn claim_node_id(&self, node_id: u64, link: &Arc<NodeLink>) -> bool {
        if node_id == self.info.node_id {
            return false;
        }
        let mut registered = lock(&self.registered);
        if registered
            .get(&node_id)
            .map_or(false, |existing| !existing.is_closed())
        {
            return false;
        }
        registered.insert(node_id, Arc::clone(link));
        true
    }

    /// Sends `message` to every registered node except `skip`.
    fn notify_registered(&self, message: &NodeMessage, skip: u64) {
        let links: Vec<(u64, Arc<NodeLink>)> = lock(&self.registered)
            .iter()
            .filter(|(id, _)| **id != skip)
            .map(|(id, link)| (*id, Arc::clone(link)))
            .collect();
        for (node_id, link) in links {
            if let Err(e) = link.send(message) {
                debug!("Could not notify node {}: {}", node_id, e);
            }
        }
    }

    /// Master side removal of a member.
    fn unregister(&self, node_id: u64) {
        let link = lock(&self.registered).remove(&node_id);
        let Some(member) = self.members.remove(node_id) else {
            return;
        };
        if let Some(link) = link {
            link.close();
        }
        info!("Member unregistered: {}", member);
        self.router.invalidate(node_id);
        self.notify_registered(&NodeMessage::MemberRemoved { node_id }, node_id);
        self.run_unregister_hooks(&member);
    }

    /// Service node side: the master announced a departure.
    fn member_removed(&self, node_id: u64) {
        if node_id == self.info.node_id {
            warn!("Master dropped this node from the cluster; registering again");
            if let Some(link) = lock(&self.master_link).take() {
                link.close();
            }
            return;
        }
        if let Some(member) = self.members.remove(node_id) {
            info!("Member left: {}", member);
            self.router.invalidate(node_id);
            self.run_unregister_hooks(&member);
        }
    }

    fn run_unregister_hooks(&self, member: &MemberInfo) {
        for hook in &self.on_unregister {
            hook(member);
        }
    }

    fn registration_accepted(&self, members: Vec<MemberInfo>) {
        info!(
            "Registered with master, cluster has {} members",
            members.len()
        );
        if self.config.debug {
            for member in &members {
                debug!("  {}", member);
            }
        }
        self.members.replace_all(members);
        self.registered_tx.send_replace(true);
    }

    fn link_closed(&self, link: &Arc<NodeLink>) {
        let lost: Vec<u64> = lock(&self.registered)
            .iter()
            .filter(|(_, registered)| Arc::ptr_eq(registered, link))
            .map(|(id, _)| *id)
            .collect();
        for node_id in lost {
            if !self.is_shutting_down() {
                warn!("Link to node {} closed", node_id);
            }
            self.unregister(node_id);
        }

        let mut master = lock(&self.master_link);
        if master.as_ref().map_or(false, |m| Arc::ptr_eq(m, link)) {
            master.take();
            self.registered_tx.send_replace(false);
        }
        drop(master);

        lock(&self.accepted).retain(|accepted| !Arc::ptr_eq(accepted, link));
        self.router.link_closed(link);
    }
}

struct NodeHandler {
    node: Weak<Shared>,
}

impl LinkHandler for NodeHandler {
    fn on_message(&self, link: &Arc<NodeLink>, message: NodeMessage) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        match message {
            NodeMessage::Register { member } => node.accept_registration(link, member),
            NodeMessage::Unregister { node_id } => {
                if node.config.is_master {
                    node.unregister(node_id);
                }
            }
            NodeMessage::Heartbeat { node_id } => {
                if !node.members.touch(node_id) {
                    debug!("Heartbeat from unknown node {}", node_id);
                }
            }
            NodeMessage::RegisterAck { members } => node.registration_accepted(members),
            NodeMessage::RegisterRejected { reason } => {
                warn!("Master rejected registration: {}", reason);
                link.close();
            }
            NodeMessage::MemberAdded { member } => {
                if node.members.add(member.clone()) {
                    info!("Member joined: {}", member);
                }
            }
            NodeMessage::MemberRemoved { node_id } => node.member_removed(node_id),
            other => node.router.handle_link_message(link, other),
        }
    }

    fn on_closed(&self, link: &Arc<NodeLink>) {
        if let Some(node) = self.node.upgrade() {
            node.link_closed(link);
        }
    }
}

fn spawn_link_listener(listener: TcpListener, inner: &Arc<Shared>) -> JoinHandle<()> {
    let handler = inner.handler();
    let node = Arc::downgrade(inner);
    let max_packet_size = inner.config.max_packet_size;
    let mut shutdown = inner.shutdown_tx.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", peer, e);
                        }
                        debug!("Accepted link from {}", peer);
                        let link = NodeLink::spawn(stream, peer.to_string(), Arc::clone(&handler), max_packet_size);
                        match node.upgrade() {
                            Some(node) => lock(&node.accepted).push(link),
                            None => link.close(),
                        }
                    }
                    Err(e) => warn!("Failed to accept link: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_client_listener(listener: TcpListener, inner: &Arc<Shared>) -> JoinHandle<()> {
    let router = Arc::clone(&inner.router);
    let heartbeat = inner.config.heartbeat_interval;
    let mut shutdown = inner.shutdown_tx.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", peer, e);
                        }
                        tokio::spawn(serve_client(stream, peer.to_string(), Arc::clone(&router), heartbeat));
                    }
                    Err(e) => warn!("Failed to accept client: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Keeps a service node registered with the master for the node's lifetime.
async fn register_loop(node: Arc<Shared>, master_addr: String) {
    let mut shutdown = node.shutdown_tx.subscribe();
    let retry = node.config.retry_interval;

    while !node.is_shutting_down() {
        match NodeLink::connect(&master_addr, node.handler(), node.config.max_packet_size).await {
            Ok(link) => {
                *lock(&node.master_link) = Some(Arc::clone(&link));
                let register = NodeMessage::Register {
                    member: node.info.clone(),
                };
                if let Err(e) = link.send(&register) {
                    warn!("Could not send registration to {}: {}", master_addr, e);
                    link.close();
                }
                tokio::select! {
                    _ = link.wait_closed() => {}
                    _ = shutdown.changed() => break,
                }
                node.registered_tx.send_replace(false);
                if !node.is_shutting_down() {
                    warn!("Link to master {} lost; registering again in {:?}", master_addr, retry);
                }
            }
            Err(e) => warn!(
                "Could not reach master at {}: {}; retrying in {:?}",
                master_addr, e, retry
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Registration loop for node {} stopped", node.info.node_id);
}

fn schedule_housekeeping(inner: &Arc<Shared>) -> Result<()> {
    let interval = inner.config.heartbeat_interval;
    let timeout = inner.config.heartbeat_timeout;

    if inner.info.client_addr.is_some() {
        let sessions = Arc::clone(&inner.sessions);
        inner.scheduler.every(interval, move || {
            for session in sessions.check_timeouts(timeout) {
                info!("Session {} timed out", session.id());
                session.close();
            }
        })?;
    }

    if inner.config.is_master {
        let node = Arc::downgrade(inner);
        inner.scheduler.every(interval, move || {
            let Some(node) = node.upgrade() else { return };
            for node_id in node.members.expired(timeout, node.info.node_id) {
                warn!("Node {} missed its heartbeats", node_id);
                node.unregister(node_id);
            }
        })?;
    } else if inner.config.master_addr.is_some() {
        let node = Arc::downgrade(inner);
        inner.scheduler.every(interval, move || {
            let Some(node) = node.upgrade() else { return };
            let link = lock(&node.master_link).clone();
            if let Some(link) = link {
                let heartbeat = NodeMessage::Heartbeat {
                    node_id: node.info.node_id,
                };
                if let Err(e) = link.send(&heartbeat) {
                    debug!("Heartbeat to master failed: {}", e);
                }
            }
        })?;
    }
    Ok(())
}

/// A running cluster node.
pub struct Node {
    inner: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn node_id(&self) -> u64 {
        self.inner.info.node_id
    }

    pub fn is_master(&self) -> bool {
        self.inner.config.is_master
    }

    /// This node's descriptor as advertised to the cluster.
    pub fn info(&self) -> &MemberInfo {
        &self.inner.info
    }

    /// Bound service address (the client address for singletons).
    pub fn service_addr(&self) -> &str {
        &self.inner.info.service_addr
    }

    pub fn client_addr(&self) -> Option<&str> {
        self.inner.info.client_addr.as_deref()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.inner.members.snapshot()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.config.master_addr.is_none() || *self.inner.registered_tx.borrow()
    }

    /// Waits until the master has acknowledged this node. Returns at once
    /// for masters and singletons.
    pub async fn wait_registered(&self, timeout: Duration) -> Result<()> {
        if self.inner.config.master_addr.is_none() {
            return Ok(());
        }
        let mut registered = self.inner.registered_tx.subscribe();
        let outcome = match tokio::time::timeout(timeout, registered.wait_for(|done| *done)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Registration("node stopped".into())),
            Err(_) => Err(Error::Registration(format!(
                "not registered within {timeout:?}"
            ))),
        };
        outcome
    }

    /// On the master, removes `node_id` from the cluster. On a service node,
    /// announces this node's own departure to the master.
    pub fn unregister(&self, node_id: u64) -> Result<()> {
        if self.inner.config.is_master {
            self.inner.unregister(node_id);
            return Ok(());
        }
        if node_id != self.node_id() {
            return Err(Error::Registration(
                "only the master can unregister other nodes".into(),
            ));
        }
        let link = lock(&self.inner.master_link).clone();
        match link {
            Some(link) => link.send(&NodeMessage::Unregister { node_id }),
            None => Ok(()),
        }
    }

    /// Deregisters from the master, stops accepting, and closes every link
    /// and session. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Node {} shutting down", self.node_id());

        let master = lock(&self.inner.master_link).take();
        if let Some(link) = master {
            let node_id = self.node_id();
            if let Err(e) = link.send(&NodeMessage::Unregister { node_id }) {
                debug!("Could not deregister from master: {}", e);
            }
            link.close();
        }

        let registered: Vec<Arc<NodeLink>> = lock(&self.inner.registered)
            .drain()
            .map(|(_, link)| link)
            .collect();
        let accepted: Vec<Arc<NodeLink>> = lock(&self.inner.accepted).drain(..).collect();
        for link in registered.into_iter().chain(accepted) {
            link.close();
        }

        self.inner.router.close_links();
        self.inner.sessions.close_all();
        self.inner.scheduler.close();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Node {} stopped", self.node_id());
    }
}
