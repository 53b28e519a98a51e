//! # griddht - Kademlia DHT for a Compute Grid
//!
//! Peer discovery and a replicated, signed key-value namespace for grid
//! nodes, without a central registry:
//!
//! - **Identity**: 256-bit IDs derived from secp256k1 public keys, XOR metric
//! - **Routing**: 256 k-buckets, most-recently-seen first
//! - **Storage**: hierarchical keys `/<owner>/a/b/c/d`, owner proven by signature
//! - **Lookup**: iterative parallel closest-node search
//! - **Transport**: pluggable; TCP and an in-memory network ship with the crate
//!
//! ## Architecture
//!
//! Routing table and store belong to a single state actor. Everything else
//! reaches them through a cheap-to-clone handle that sends jobs over a
//! bounded channel and awaits the reply, so no lock ever guards them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`Kademlia`]: Ping, FindContacts, Put, Get, RegisterNetwork, inbound handlers |
//! | `identity` | [`KademliaID`], [`Contact`] |
//! | `crypto` | Hashing, recoverable signatures, [`Keypair`] |
//! | `routing` | Buckets and the routing table |
//! | `kvstore` | Trie-backed key-value store |
//! | `dht` | State actor owning routing table and store |
//! | `rpc` | Correlation-ID dispatcher |
//! | `messages` | Wire envelope and payloads |
//! | `protocols` | [`Transport`] and [`Socket`] traits |
//! | `transport` | [`TcpTransport`], [`MockNetwork`] |
//! | `config` | [`DhtConfig`] |
//! | `error` | [`DhtError`] |

pub mod config;
pub mod crypto;
pub mod dht;
pub mod error;
pub mod identity;
pub mod kvstore;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod routing;
pub mod rpc;
pub mod transport;

pub use config::DhtConfig;
pub use crypto::Keypair;
pub use dht::{DhtState, StateSnapshot};
pub use error::{DhtError, Result};
pub use identity::{Contact, KademliaID};
pub use kvstore::KV;
pub use node::Kademlia;
pub use protocols::{Socket, Transport};
pub use transport::{MockNetwork, TcpTransport};
