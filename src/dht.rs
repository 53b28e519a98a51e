//! # State Actor
//!
//! One task owns the [`RoutingTable`] and the [`KvStore`]. Everything else
//! talks to it through [`DhtState`], a cheap-to-clone handle that enqueues a
//! [`Command`] and awaits the reply on a oneshot channel.
//!
//! Jobs are processed strictly in arrival order and each one runs to
//! completion before the next is read, so reads and writes of routing and
//! store state are linearizable without locks.
//!
//! The queue is bounded; when it is full, producers wait.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::identity::{Contact, KademliaID};
use crate::kvstore::{KvStore, KV};
use crate::routing::{BucketTouchOutcome, RoutingTable};

/// Counters reported by the `Stats` job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub contacts: usize,
    pub stored_values: usize,
}

enum Command {
    AddContact(Contact, oneshot::Sender<BucketTouchOutcome>),
    FindContacts(KademliaID, usize, oneshot::Sender<Vec<Contact>>),
    Put {
        key: String,
        value: String,
        sig: String,
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Get(String, oneshot::Sender<Result<Vec<KV>>>),
    RemoveContact(KademliaID, oneshot::Sender<bool>),
    RemoveKey(String, oneshot::Sender<Result<()>>),
    Stats(oneshot::Sender<StateSnapshot>),
    Stop,
}

#[derive(Clone)]
pub struct DhtState {
    cmd_tx: mpsc::Sender<Command>,
    me: Contact,
}

impl std::fmt::Debug for DhtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtState").field("me", &self.me).finish_non_exhaustive()
    }
}

struct StateActor {
    routing: RoutingTable,
    store: KvStore,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DhtState {
    /// Spawn the actor task on the current runtime.
    pub fn spawn(me: Contact, config: &DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.state_queue_capacity.max(1));
        let actor = StateActor {
            routing: RoutingTable::new(me.clone(), config.bucket_size),
            store: KvStore::new(),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, me }
    }

    pub fn me(&self) -> &Contact {
        &self.me
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| DhtError::ActorClosed)?;
        rx.await.map_err(|_| DhtError::ActorClosed)
    }

    pub async fn add_contact(&self, contact: Contact) -> Result<BucketTouchOutcome> {
        self.call(|tx| Command::AddContact(contact, tx)).await
    }

    /// Up to `count` known contacts nearest to `target`, nearest first.
    pub async fn find_contacts(&self, target: KademliaID, count: usize) -> Result<Vec<Contact>> {
        self.call(|tx| Command::FindContacts(target, count, tx)).await
    }

    pub async fn put(&self, key: &str, value: &str, sig: &str, id: &str) -> Result<()> {
        let (key, value, sig, id) = (key.to_owned(), value.to_owned(), sig.to_owned(), id.to_owned());
        self.call(|reply| Command::Put {
            key,
            value,
            sig,
            id,
            reply,
        })
        .await?
    }

    /// Every record stored at `prefix` or below.
    pub async fn get(&self, prefix: &str) -> Result<Vec<KV>> {
        let prefix = prefix.to_owned();
        self.call(|tx| Command::Get(prefix, tx)).await?
    }

    pub async fn remove_contact(&self, id: KademliaID) -> Result<bool> {
        self.call(|tx| Command::RemoveContact(id, tx)).await
    }

    pub async fn remove_key(&self, key: &str) -> Result<()> {
        let key = key.to_owned();
        self.call(|tx| Command::RemoveKey(key, tx)).await?
    }

    pub async fn stats(&self) -> Result<StateSnapshot> {
        self.call(Command::Stats).await
    }

    /// Ask the actor to exit after the jobs already queued.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }
}

impl StateActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::AddContact(contact, reply) => {
                    let outcome = self.routing.add_contact(contact.clone());
                    if outcome == BucketTouchOutcome::Full {
                        trace!(peer = %contact, "bucket full, contact dropped");
                    }
                    let _ = reply.send(outcome);
                }
                Command::FindContacts(target, count, reply) => {
                    let _ = reply.send(self.routing.find_closest_contacts(&target, count));
                }
                Command::Put {
                    key,
                    value,
                    sig,
                    id,
                    reply,
                } => {
                    let _ = reply.send(self.store.put(&key, &value, &sig, &id));
                }
                Command::Get(prefix, reply) => {
                    let _ = reply.send(self.store.get_all_values_with_prefix(&prefix));
                }
                Command::RemoveContact(id, reply) => {
                    let _ = reply.send(self.routing.remove_contact(&id));
                }
                Command::RemoveKey(key, reply) => {
                    let _ = reply.send(self.store.remove_key(&key));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(StateSnapshot {
                        contacts: self.routing.len(),
                        stored_values: self.store.len(),
                    });
                }
                Command::Stop => break,
            }
        }
        debug!(me = %self.routing.me(), "state actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn spawn_state() -> DhtState {
        let me = Contact::new(KademliaID::random(), "127.0.0.1:1000");
        DhtState::spawn(me, &DhtConfig::default())
    }

    #[tokio::test]
    async fn add_then_find_contacts() {
        let state = spawn_state();
        let peer = Contact::new(KademliaID::random(), "127.0.0.1:1001");
        assert_eq!(
            state.add_contact(peer.clone()).await.expect("add"),
            BucketTouchOutcome::Inserted
        );
        assert_eq!(
            state.add_contact(peer.clone()).await.expect("add"),
            BucketTouchOutcome::Refreshed
        );
        assert_eq!(
            state.add_contact(state.me().clone()).await.expect("add"),
            BucketTouchOutcome::Ignored
        );

        let found = state.find_contacts(peer.id, 1).await.expect("find");
        assert_eq!(found, vec![peer]);
    }

    #[tokio::test]
    async fn store_jobs_roundtrip() {
        let state = spawn_state();
        state.put("/o/a", "1", "sig", "o").await.expect("put");
        state.put("/o/a/b", "2", "sig", "o").await.expect("put");

        let mut kvs = state.get("/o").await.expect("get");
        kvs.sort();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].value, "1");

        assert!(matches!(state.put("bad", "v", "s", "o").await, Err(DhtError::InvalidKey(_))));

        state.remove_key("/o/a").await.expect("remove");
        let stats = state.stats().await.expect("stats");
        assert_eq!(stats.stored_values, 1);
    }

    #[tokio::test]
    async fn remove_contact_job() {
        let state = spawn_state();
        let peer = Contact::new(KademliaID::random(), "127.0.0.1:1001");
        state.add_contact(peer.clone()).await.expect("add");
        assert!(state.remove_contact(peer.id).await.expect("remove"));
        assert_eq!(state.stats().await.expect("stats").contacts, 0);
    }

    #[tokio::test]
    async fn concurrent_adds_and_finds_see_whole_buckets() {
        let state = spawn_state();
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..200u32 {
            let state = state.clone();
            tasks.spawn(async move {
                let c = Contact::new(KademliaID::random(), format!("10.0.{}.{}:1", i / 256, i % 256));
                state.add_contact(c).await.expect("add");
                let found = state
                    .find_contacts(KademliaID::random(), 20)
                    .await
                    .expect("find");
                let unique: HashSet<_> = found.iter().map(|c| c.id).collect();
                assert_eq!(unique.len(), found.len());
                assert!(found.len() <= 20);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.expect("task");
        }

        let stats = state.stats().await.expect("stats");
        assert!(stats.contacts > 0 && stats.contacts <= 200);
    }

    #[tokio::test]
    async fn stopped_actor_reports_closed() {
        let state = spawn_state();
        state.stop().await;
        let err = state.stats().await.expect_err("actor gone");
        assert!(matches!(err, DhtError::ActorClosed));
    }
}
