//! # Kademlia Node
//!
//! [`Kademlia`] ties the state actor, the dispatcher and a transport into
//! one peer:
//!
//! ```ignore
//! let net = Arc::new(TcpTransport::default());
//! let node = Kademlia::start(net, "10.0.0.2:4000", keypair.id(), DhtConfig::default()).await?;
//! node.register_network("10.0.0.1:4000").await?;
//!
//! let key = format!("/{}/status", keypair.id());
//! node.put(&keypair, &key, "idle", 3).await?;
//! let records = node.get(&keypair.id(), &key, 3).await?;
//! ```
//!
//! ## Lookup
//!
//! [`Kademlia::find_contacts`] seeds a queue with the nearest locally known
//! contacts and queries each newly seen peer for contacts near the target.
//! Answers feed back into the queue. Queries run in parallel, bounded by a
//! semaphore of `max_pending_requests` permits, and the lookup ends once the
//! queue is empty and no query is still in flight.
//!
//! ## Replication
//!
//! Records owned by identity `I` live on the `replication_factor` peers
//! closest to `BLAKE3(I)`. Put writes to all of them and fails if any one
//! fails; Get reads from all of them and returns whatever the reachable ones
//! hold.
//!
//! ## Inbound
//!
//! Each request handler learns the sender's contact, performs its state
//! operation under `request_timeout`, and answers with an explicit status.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::crypto::{generate_hash, recover_id, sign, Keypair};
use crate::dht::{DhtState, StateSnapshot};
use crate::error::{DhtError, Result};
use crate::identity::{Contact, KademliaID};
use crate::kvstore::{get_root_key, validate_key, KV};
use crate::messages::{
    decode_payload, encode_payload, FindContactsReq, FindContactsResp, GetReq, GetResp, Message,
    MessageType, PingReq, PingResp, PutReq, PutResp, Response, RpcHeader, Status,
    MAX_PAYLOAD_SIZE,
};
use crate::protocols::{Socket, Transport};
use crate::rpc::{Dispatcher, RequestHandler};

pub struct Kademlia<T: Transport> {
    me: Contact,
    config: DhtConfig,
    state: DhtState,
    dispatcher: Arc<Dispatcher<T>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<T: Transport> Clone for Kademlia<T> {
    fn clone(&self) -> Self {
        Self {
            me: self.me.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Kademlia<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kademlia").field("me", &self.me).finish_non_exhaustive()
    }
}

/// Enforce `1 <= n`, clamping to `max`.
fn clamp_count(n: usize, max: usize, what: &str) -> Result<usize> {
    if n == 0 {
        return Err(DhtError::Validation(format!("{} must be at least 1", what)));
    }
    Ok(n.min(max))
}

/// Room left in a frame for the envelope fields around the payload.
const ENVELOPE_HEADROOM: usize = 1024;

/// Largest request payload a peer will accept. The payload travels as hex
/// inside the envelope, so it takes twice its size in a frame.
fn max_request_payload(max_frame_size: usize) -> usize {
    MAX_PAYLOAD_SIZE.min(max_frame_size.saturating_sub(ENVELOPE_HEADROOM) / 2)
}

/// Peers holding the records of `owner` are those closest to this ID.
pub fn replica_target(owner: &KademliaID) -> KademliaID {
    KademliaID::from_data(owner.as_bytes())
}

/// Peers dial the advertised address back, so a wildcard IP or port is no
/// use to them. Non-socket addresses (in-memory networks) pass through.
fn check_advertised(addr: &str) -> Result<()> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        if sock.ip().is_unspecified() || sock.port() == 0 {
            return Err(DhtError::Validation(format!(
                "cannot advertise {}: peers need a concrete address",
                addr
            )));
        }
    }
    Ok(())
}

impl<T: Transport> Kademlia<T> {
    /// Bind `addr` on `transport` and start serving as `id`. The bound
    /// address is what peers learn, so it must not be a wildcard.
    pub async fn start(transport: Arc<T>, addr: &str, id: KademliaID, config: DhtConfig) -> Result<Self> {
        Self::start_advertising(transport, addr, None, id, config).await
    }

    /// Like [`start`](Self::start), but peers are told `advertise` instead
    /// of the bound address. Use it when binding `0.0.0.0` or behind a
    /// port mapping.
    pub async fn start_advertising(
        transport: Arc<T>,
        addr: &str,
        advertise: Option<&str>,
        id: KademliaID,
        config: DhtConfig,
    ) -> Result<Self> {
        if let Some(advertise) = advertise {
            check_advertised(advertise)?;
        }
        let socket = transport.listen(addr).await?;
        let local_addr = match advertise {
            Some(advertise) => advertise.to_string(),
            None => socket.local_addr(),
        };
        if let Err(e) = check_advertised(&local_addr) {
            socket.close().await;
            return Err(e);
        }
        let me = Contact::new(id, local_addr.clone());

        let state = DhtState::spawn(me.clone(), &config);
        let dispatcher = Arc::new(Dispatcher::new(transport, local_addr));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler = Arc::new(InboundHandler {
            me: me.clone(),
            config: config.clone(),
            state: state.clone(),
        });
        dispatcher.start(socket, handler, shutdown_rx);

        debug!(me = %me, "kademlia node started");
        Ok(Self {
            me,
            config,
            state,
            dispatcher,
            shutdown: Arc::new(shutdown_tx),
        })
    }

    pub fn me(&self) -> &Contact {
        &self.me
    }

    pub fn id(&self) -> KademliaID {
        self.me.id
    }

    pub fn address(&self) -> &str {
        &self.me.address
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn state(&self) -> &DhtState {
        &self.state
    }

    pub async fn stats(&self) -> Result<StateSnapshot> {
        self.state.stats().await
    }

    fn header(&self) -> RpcHeader {
        RpcHeader {
            sender: self.me.clone(),
        }
    }

    /// Fold a contact into the routing table unless it is us or malformed.
    async fn learn(&self, contact: Contact) {
        learn_contact(&self.state, &self.me, contact).await;
    }

    /// Ping `addr`; on success the responder is learned and returned.
    pub async fn ping(&self, addr: &str) -> Result<Contact> {
        let req = PingReq {
            header: self.header(),
        };
        let resp = self
            .dispatcher
            .call(addr, &req, self.config.request_timeout)
            .await?
            .into_result()?;
        let peer = resp.header.sender;
        if !peer.validate_structure() {
            return Err(DhtError::Protocol(format!("malformed contact from {}", addr)));
        }
        self.learn(peer.clone()).await;
        trace!(peer = %peer, "ping ok");
        Ok(peer)
    }

    pub async fn find_local_contacts(&self, target: KademliaID, count: usize) -> Result<Vec<Contact>> {
        self.state.find_contacts(target, count).await
    }

    /// Ask `contact` for up to `count` contacts near `target`.
    pub async fn find_remote_contacts(
        &self,
        contact: &Contact,
        target: KademliaID,
        count: usize,
    ) -> Result<Vec<Contact>> {
        let req = FindContactsReq {
            header: self.header(),
            target,
            count,
        };
        let resp = self
            .dispatcher
            .call(&contact.address, &req, self.config.request_timeout)
            .await?
            .into_result()?;

        self.learn(resp.header.sender).await;
        let mut contacts = Vec::with_capacity(resp.contacts.len());
        for c in resp.contacts {
            if c.validate_structure() {
                self.learn(c.clone()).await;
                contacts.push(c);
            } else {
                trace!(from = %contact, "skipping malformed contact");
            }
        }
        Ok(contacts)
    }

    /// Iterative lookup of the `count` peers closest to `target`.
    ///
    /// The local node is never part of the result and each ID appears at
    /// most once. With `count == 1` the lookup stops as soon as a peer whose
    /// ID equals `target` turns up.
    pub async fn find_contacts(&self, target: KademliaID, count: usize) -> Result<Vec<Contact>> {
        let count = clamp_count(count, self.config.max_count, "count")?;

        let mut pending: VecDeque<Contact> = self.find_local_contacts(target, count).await?.into();
        let mut queried: HashSet<String> = HashSet::new();
        let mut found: HashMap<KademliaID, Contact> = HashMap::new();
        let mut in_flight: JoinSet<(Contact, Result<Vec<Contact>>)> = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.config.max_pending_requests.max(1)));

        loop {
            while let Some(mut contact) = pending.pop_front() {
                if contact.id == self.me.id || contact.address == self.me.address {
                    continue;
                }
                if count == 1 && contact.id == target {
                    contact.calc_distance(&target);
                    debug!(target = %target.short(), peer = %contact, "lookup hit exact match");
                    return Ok(vec![contact]);
                }
                if !queried.insert(contact.address.clone()) {
                    continue;
                }
                found.entry(contact.id).or_insert_with(|| contact.clone());

                let this = self.clone();
                let permits = Arc::clone(&permits);
                in_flight.spawn(async move {
                    let result = match permits.acquire_owned().await {
                        Ok(_permit) => this.find_remote_contacts(&contact, target, count).await,
                        Err(_) => Err(DhtError::Transport("lookup cancelled".to_string())),
                    };
                    (contact, result)
                });
            }

            match in_flight.join_next().await {
                None => break,
                Some(Ok((peer, Ok(contacts)))) => {
                    // An ID seen at several addresses keeps the one that answered.
                    found.insert(peer.id, peer);
                    pending.extend(contacts);
                }
                Some(Ok((peer, Err(e)))) => {
                    debug!(peer = %peer, error = %e, "lookup query failed");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "lookup task failed");
                }
            }
        }

        let mut result: Vec<Contact> = found
            .into_values()
            .map(|mut c| {
                c.calc_distance(&target);
                c
            })
            .collect();
        crate::routing::sort_by_distance(&mut result);
        result.truncate(count);

        debug!(target = %target.short(), found = result.len(), "lookup complete");
        Ok(result)
    }

    /// Sign `value` with `keypair` and store it under `key` on the
    /// `replication_factor` peers closest to the owner. `key`'s first segment
    /// must be the hex ID of `keypair`.
    pub async fn put(&self, keypair: &Keypair, key: &str, value: &str, replication_factor: usize) -> Result<()> {
        let rf = clamp_count(replication_factor, self.config.max_count, "replication factor")?;
        let owner = keypair.id();
        let root = get_root_key(key)?;
        if root != owner.to_hex() {
            return Err(DhtError::Validation(format!(
                "key root {} does not match owner {}",
                root,
                owner.short()
            )));
        }

        let sig = sign(&generate_hash(value.as_bytes()), keypair)?;
        let req = PutReq {
            header: self.header(),
            key: key.to_string(),
            value: value.to_string(),
            sig,
        };
        let size = encode_payload(&req)?.len();
        let limit = max_request_payload(self.config.max_frame_size);
        if size > limit {
            return Err(DhtError::Validation(format!(
                "put request is {} bytes (max {})",
                size, limit
            )));
        }

        let replicas = self.find_contacts(replica_target(&owner), rf).await?;
        if replicas.is_empty() {
            return Err(DhtError::NotFound(format!("no replicas for owner {}", owner.short())));
        }

        let mut set = JoinSet::new();
        for replica in replicas {
            let this = self.clone();
            let req = req.clone();
            set.spawn(async move {
                let res = this
                    .dispatcher
                    .call(&replica.address, &req, this.config.request_timeout)
                    .await
                    .and_then(Response::into_result);
                (replica, res)
            });
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((replica, Ok(resp))) => {
                    trace!(replica = %replica, "put stored");
                    self.learn(resp.header.sender).await;
                }
                Ok((replica, Err(e))) => {
                    debug!(replica = %replica, key = %key, error = %e, "put failed on replica");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(DhtError::Transport(format!("put task failed: {}", e)));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Every record at or below `key` held by the replicas of `owner`.
    ///
    /// Replica answers are merged and de-duplicated; unreachable replicas
    /// are skipped. The result is sorted by key, then value.
    pub async fn get(&self, owner: &KademliaID, key: &str, replication_factor: usize) -> Result<Vec<KV>> {
        let rf = clamp_count(replication_factor, self.config.max_count, "replication factor")?;
        validate_key(key)?;

        let replicas = self.find_contacts(replica_target(owner), rf).await?;

        let mut set = JoinSet::new();
        for replica in replicas {
            let this = self.clone();
            let req = GetReq {
                header: self.header(),
                key: key.to_string(),
            };
            set.spawn(async move {
                let res = this
                    .dispatcher
                    .call(&replica.address, &req, this.config.request_timeout)
                    .await
                    .and_then(Response::into_result);
                (replica, res)
            });
        }

        let mut merged: HashSet<KV> = HashSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(resp))) => {
                    self.learn(resp.header.sender).await;
                    merged.extend(resp.kvs);
                }
                Ok((replica, Err(DhtError::Rejected(reason)))) => {
                    debug!(replica = %replica, key = %key, reason = %reason, "replica has no value");
                }
                Ok((replica, Err(e))) => {
                    warn!(replica = %replica, key = %key, error = %e, "get failed on replica");
                }
                Err(e) => {
                    warn!(error = %e, "get task failed");
                }
            }
        }

        let mut out: Vec<KV> = merged.into_iter().collect();
        out.sort_by(|a, b| {
            (&a.key, &a.value, &a.id, &a.sig).cmp(&(&b.key, &b.value, &b.id, &b.sig))
        });
        Ok(out)
    }

    /// Join the network through `bootstrap`: ping it, then look ourselves
    /// up so the peers along the way learn our contact.
    pub async fn register_network(&self, bootstrap: &str) -> Result<Vec<Contact>> {
        let peer = self.ping(bootstrap).await?;
        let found = self
            .find_contacts(self.me.id, self.config.register_lookup_count)
            .await?;
        info!(bootstrap = %peer, peers = found.len(), "registered with network");
        Ok(found)
    }

    /// Stop the state actor and the receive loop.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.state.stop().await;
        debug!(me = %self.me, "kademlia node stopped");
    }
}

async fn learn_contact(state: &DhtState, me: &Contact, contact: Contact) {
    if contact.id == me.id || !contact.validate_structure() {
        trace!(contact = %contact, "not learning contact");
        return;
    }
    if let Err(e) = state.add_contact(contact).await {
        trace!(error = %e, "failed to learn contact");
    }
}

/// Serves the four inbound request types against the state actor.
struct InboundHandler {
    me: Contact,
    config: DhtConfig,
    state: DhtState,
}

impl InboundHandler {
    fn header(&self) -> RpcHeader {
        RpcHeader {
            sender: self.me.clone(),
        }
    }

    async fn bounded<F, R>(&self, fut: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| DhtError::Timeout)?
    }

    async fn learn_sender(&self, header: &RpcHeader) {
        let learned = tokio::time::timeout(
            self.config.request_timeout,
            learn_contact(&self.state, &self.me, header.sender.clone()),
        )
        .await;
        if learned.is_err() {
            trace!(sender = %header.sender, "timed out learning sender");
        }
    }

    async fn handle_ping(&self, req: PingReq) -> PingResp {
        self.learn_sender(&req.header).await;
        PingResp {
            header: self.header(),
            status: Status::Success,
            error: String::new(),
        }
    }

    async fn handle_find_contacts(&self, req: FindContactsReq) -> FindContactsResp {
        self.learn_sender(&req.header).await;
        let result = match clamp_count(req.count, self.config.max_count, "count") {
            Ok(count) => self.bounded(self.state.find_contacts(req.target, count)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(contacts) => FindContactsResp {
                header: self.header(),
                status: Status::Success,
                error: String::new(),
                contacts,
            },
            Err(e) => FindContactsResp {
                header: self.header(),
                status: Status::Failure,
                error: e.to_string(),
                contacts: Vec::new(),
            },
        }
    }

    /// The record's signer must own the key's root segment.
    async fn store_signed(&self, req: &PutReq) -> Result<()> {
        let root = get_root_key(&req.key)?;
        let signer = recover_id(&generate_hash(req.value.as_bytes()), &req.sig)?;
        let signer_hex = signer.to_hex();
        if root != signer_hex {
            return Err(DhtError::Validation(format!(
                "key root {} does not match signer {}",
                root,
                signer.short()
            )));
        }
        self.bounded(self.state.put(&req.key, &req.value, &req.sig, &signer_hex))
            .await
    }

    async fn handle_put(&self, req: PutReq) -> PutResp {
        self.learn_sender(&req.header).await;
        match self.store_signed(&req).await {
            Ok(()) => PutResp {
                header: self.header(),
                status: Status::Success,
                error: String::new(),
            },
            Err(e) => {
                debug!(sender = %req.header.sender, key = %req.key, error = %e, "rejecting put");
                PutResp {
                    header: self.header(),
                    status: Status::Failure,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn handle_get(&self, req: GetReq) -> GetResp {
        self.learn_sender(&req.header).await;
        match self.bounded(self.state.get(&req.key)).await {
            Ok(kvs) => GetResp {
                header: self.header(),
                status: Status::Success,
                error: String::new(),
                kvs,
            },
            Err(e) => GetResp {
                header: self.header(),
                status: Status::Failure,
                error: e.to_string(),
                kvs: Vec::new(),
            },
        }
    }
}

/// Encode `resp` as the reply to `msg`.
fn reply_to<R: Response>(msg: &Message, resp: &R) -> Option<Message> {
    match encode_payload(resp) {
        Ok(payload) => Some(msg.reply(R::TYPE, payload)),
        Err(e) => {
            warn!(error = %e, "failed to encode reply");
            None
        }
    }
}

#[async_trait]
impl RequestHandler for InboundHandler {
    async fn handle_request(&self, msg: Message) -> Option<Message> {
        trace!(from = %msg.from, msg_type = ?msg.msg_type, "handling request");
        let decoded = match msg.msg_type {
            MessageType::PingReq => match decode_payload::<PingReq>(&msg.payload) {
                Ok(req) => return reply_to(&msg, &self.handle_ping(req).await),
                Err(e) => e,
            },
            MessageType::FindContactsReq => match decode_payload::<FindContactsReq>(&msg.payload) {
                Ok(req) => return reply_to(&msg, &self.handle_find_contacts(req).await),
                Err(e) => e,
            },
            MessageType::PutReq => match decode_payload::<PutReq>(&msg.payload) {
                Ok(req) => return reply_to(&msg, &self.handle_put(req).await),
                Err(e) => e,
            },
            MessageType::GetReq => match decode_payload::<GetReq>(&msg.payload) {
                Ok(req) => return reply_to(&msg, &self.handle_get(req).await),
                Err(e) => e,
            },
            other => DhtError::Protocol(format!("{:?} is not a request", other)),
        };
        warn!(from = %msg.from, msg_type = ?msg.msg_type, error = %decoded, "dropping request");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockNetwork;
    use std::time::Duration;

    async fn node(net: &MockNetwork, addr: &str) -> Kademlia<MockNetwork> {
        let config = DhtConfig::default().with_request_timeout(Duration::from_millis(200));
        Kademlia::start(Arc::new(net.clone()), addr, KademliaID::random(), config)
            .await
            .expect("start")
    }

    #[test]
    fn count_is_validated_and_clamped() {
        assert!(matches!(clamp_count(0, 100, "count"), Err(DhtError::Validation(_))));
        assert_eq!(clamp_count(5, 100, "count").expect("ok"), 5);
        assert_eq!(clamp_count(500, 100, "count").expect("ok"), 100);
    }

    #[tokio::test]
    async fn ping_learns_both_sides() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let b = node(&net, "b").await;

        let peer = a.ping("b").await.expect("ping");
        assert_eq!(peer.id, b.id());
        assert_eq!(a.stats().await.expect("stats").contacts, 1);
        assert_eq!(b.stats().await.expect("stats").contacts, 1);
    }

    #[tokio::test]
    async fn ping_to_missing_peer_fails() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        assert!(matches!(a.ping("nobody").await, Err(DhtError::Transport(_))));
    }

    #[tokio::test]
    async fn put_rejects_foreign_root_before_network() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let key = format!("/{}/x", other.id());
        assert!(matches!(a.put(&kp, &key, "v", 1).await, Err(DhtError::Validation(_))));
        assert!(matches!(a.put(&kp, "/", "v", 1).await, Err(DhtError::InvalidKey(_))));
        let own = format!("/{}/x", kp.id());
        assert!(matches!(a.put(&kp, &own, "v", 0).await, Err(DhtError::Validation(_))));
    }

    #[tokio::test]
    async fn put_without_peers_is_not_found() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let kp = Keypair::generate();
        let key = format!("/{}/x", kp.id());
        assert!(matches!(a.put(&kp, &key, "v", 3).await, Err(DhtError::NotFound(_))));
    }

    #[test]
    fn request_payload_limit_accounts_for_hex_envelope() {
        assert_eq!(max_request_payload(1024 * 1024), MAX_PAYLOAD_SIZE.min((1024 * 1024 - 1024) / 2));
        assert!(max_request_payload(1024 * 1024) * 2 + ENVELOPE_HEADROOM <= 1024 * 1024);
        assert_eq!(max_request_payload(16 * 1024 * 1024), MAX_PAYLOAD_SIZE);
        assert_eq!(max_request_payload(10), 0);
    }

    #[tokio::test]
    async fn oversized_put_is_rejected_before_sending() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let b = node(&net, "b").await;
        a.ping("b").await.expect("ping");

        let kp = Keypair::generate();
        let key = format!("/{}/blob", kp.id());
        let err = a
            .put(&kp, &key, &"x".repeat(600 * 1024), 1)
            .await
            .expect_err("too large");
        assert!(matches!(err, DhtError::Validation(_)), "{}", err);
        assert_eq!(b.stats().await.expect("stats").stored_values, 0);

        a.put(&kp, &key, "small", 1).await.expect("put");
        assert_eq!(b.stats().await.expect("stats").stored_values, 1);
    }

    #[tokio::test]
    async fn lookup_reports_each_id_once() {
        let net = MockNetwork::new();
        let seeker = node(&net, "s").await;
        let a = node(&net, "a").await;
        let b = node(&net, "b").await;
        let moved = node(&net, "moved").await;

        // `a` still knows the peer at an address nobody listens on.
        a.state()
            .add_contact(Contact::new(moved.id(), "gone"))
            .await
            .expect("add");
        b.state().add_contact(moved.me().clone()).await.expect("add");
        seeker.state().add_contact(a.me().clone()).await.expect("add");
        seeker.state().add_contact(b.me().clone()).await.expect("add");

        let found = seeker
            .find_contacts(KademliaID::random(), 10)
            .await
            .expect("lookup");

        let ids: HashSet<_> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), found.len());
        assert_eq!(found.len(), 3);
        let peer = found
            .iter()
            .find(|c| c.id == moved.id())
            .expect("moved peer found");
        assert_eq!(peer.address, "moved");
    }

    #[tokio::test]
    async fn inbound_put_checks_signer() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let handler = InboundHandler {
            me: a.me().clone(),
            config: a.config().clone(),
            state: a.state().clone(),
        };
        let kp = Keypair::generate();
        let mallory = Keypair::generate();
        let key = format!("/{}/job", kp.id());

        let forged = PutReq {
            header: RpcHeader {
                sender: Contact::new(mallory.id(), "m"),
            },
            key: key.clone(),
            value: "v".into(),
            sig: sign(&generate_hash(b"v"), &mallory).expect("sign"),
        };
        let resp = handler.handle_put(forged).await;
        assert_eq!(resp.status, Status::Failure);
        assert_eq!(a.stats().await.expect("stats").stored_values, 0);

        let genuine = PutReq {
            header: RpcHeader {
                sender: Contact::new(kp.id(), "k"),
            },
            key: key.clone(),
            value: "v".into(),
            sig: sign(&generate_hash(b"v"), &kp).expect("sign"),
        };
        let resp = handler.handle_put(genuine).await;
        assert_eq!(resp.status, Status::Success, "{}", resp.error);
        let kvs = a.state().get(&key).await.expect("get");
        assert_eq!(kvs[0].id, kp.id().to_hex());
    }

    #[tokio::test]
    async fn inbound_get_miss_is_failure_status() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let handler = InboundHandler {
            me: a.me().clone(),
            config: a.config().clone(),
            state: a.state().clone(),
        };
        let resp = handler
            .handle_get(GetReq {
                header: RpcHeader {
                    sender: Contact::new(KademliaID::random(), "x"),
                },
                key: "/nobody/here".into(),
            })
            .await;
        assert_eq!(resp.status, Status::Failure);
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test]
    async fn malformed_request_is_dropped() {
        let net = MockNetwork::new();
        let a = node(&net, "a").await;
        let handler = InboundHandler {
            me: a.me().clone(),
            config: a.config().clone(),
            state: a.state().clone(),
        };
        let msg = Message {
            id: "1".into(),
            from: "x".into(),
            to: "a".into(),
            msg_type: MessageType::PutReq,
            payload: b"not json".to_vec(),
        };
        assert!(handler.handle_request(msg).await.is_none());
    }
}
