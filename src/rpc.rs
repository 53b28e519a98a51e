//! # RPC Dispatcher
//!
//! Correlates asynchronous request/response pairs over any [`Transport`].
//!
//! ## Outbound
//!
//! [`Dispatcher::request`] stamps a fresh UUID v4 correlation ID on the
//! envelope, registers a oneshot waiter under it, dials the destination and
//! sends. The caller races the waiter against a deadline. However the call
//! ends (reply, timeout, send error or the caller dropping the future) the
//! waiter entry is removed under the same lock used to insert it.
//!
//! ## Inbound
//!
//! [`Dispatcher::start`] runs the receive loop on the local listening socket:
//!
//! - responses are handed to the waiter registered under their ID, or logged
//!   and dropped when there is none (late or duplicate replies)
//! - requests are passed to a [`RequestHandler`] on their own task, and the
//!   handler's reply is sent back through the dispatcher

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{DhtError, Result};
use crate::messages::{decode_payload, encode_payload, Message, MessageType, Request};
use crate::protocols::{Socket, Transport};

/// Serves inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Build the reply to `msg`, or `None` to drop the request.
    async fn handle_request(&self, msg: Message) -> Option<Message>;
}

type Waiters = HashMap<String, oneshot::Sender<Message>>;

pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    local_addr: String,
    pending: Mutex<Waiters>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, local_addr: impl Into<String>) -> Self {
        Self {
            transport,
            local_addr: local_addr.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.waiters().len()
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `msg` to `msg.to` without waiting for anything back.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let socket = self.transport.dial(&msg.to).await?;
        socket.send(msg).await
    }

    /// Send a request envelope and wait up to `timeout` for the matching
    /// response.
    pub async fn request(
        &self,
        to: &str,
        msg_type: MessageType,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        let expected = msg_type.response_type().ok_or_else(|| {
            DhtError::Protocol(format!("{:?} is not a request type", msg_type))
        })?;

        let msg = Message {
            id: Uuid::new_v4().to_string(),
            from: self.local_addr.clone(),
            to: to.to_string(),
            msg_type,
            payload,
        };

        let (tx, rx) = oneshot::channel();
        self.waiters().insert(msg.id.clone(), tx);
        let _registered = WaiterGuard {
            dispatcher: self,
            id: &msg.id,
        };

        self.send(&msg).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => {
                if resp.msg_type != expected {
                    return Err(DhtError::Protocol(format!(
                        "expected {:?}, got {:?}",
                        expected, resp.msg_type
                    )));
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(DhtError::Transport("dispatcher stopped".to_string())),
            Err(_) => {
                trace!(to = %to, id = %msg.id, "request timed out");
                Err(DhtError::Timeout)
            }
        }
    }

    /// Typed request: encode `req`, await and decode the response payload.
    pub async fn call<R: Request>(&self, to: &str, req: &R, timeout: Duration) -> Result<R::Response> {
        let payload = encode_payload(req)?;
        let resp = self.request(to, R::TYPE, payload, timeout).await?;
        decode_payload(&resp.payload)
    }

    fn route_response(&self, msg: Message) {
        let waiter = self.waiters().remove(&msg.id);
        match waiter {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    trace!("waiter dropped before reply arrived");
                }
            }
            None => {
                warn!(
                    id = %msg.id,
                    from = %msg.from,
                    msg_type = ?msg.msg_type,
                    "dropping response with no registered waiter"
                );
            }
        }
    }

    fn fail_all_waiters(&self) {
        // Dropping the senders wakes every caller with an error.
        self.waiters().clear();
    }
}

/// Removes a waiter when its request finishes, fails, times out or is
/// cancelled by the caller dropping the future.
struct WaiterGuard<'a, T: Transport> {
    dispatcher: &'a Dispatcher<T>,
    id: &'a str,
}

impl<T: Transport> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        self.dispatcher.waiters().remove(self.id);
    }
}

impl<T: Transport> Dispatcher<T> {
    /// Spawn the receive loop. It ends when `shutdown` flips to `true` or the
    /// socket closes; any callers still waiting are then failed.
    pub fn start<H: RequestHandler>(
        self: &Arc<Self>,
        socket: T::Socket,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = stop_requested(&mut shutdown) => break,
                    received = socket.receive() => match received {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(error = %e, "receive loop ending");
                            break;
                        }
                    },
                };

                if msg.msg_type.is_response() {
                    dispatcher.route_response(msg);
                    continue;
                }

                let dispatcher = Arc::clone(&dispatcher);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let from = msg.from.clone();
                    let msg_type = msg.msg_type;
                    if let Some(reply) = handler.handle_request(msg).await {
                        if let Err(e) = dispatcher.send(&reply).await {
                            debug!(to = %from, msg_type = ?msg_type, error = %e, "failed to send reply");
                        }
                    }
                });
            }

            socket.close().await;
            dispatcher.fail_all_waiters();
        })
    }
}

/// Resolves once the flag reads `true` or its sender is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
