//! Redis backend.
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own.
//! Subscriptions share one pub/sub connection; a dispatcher task reads it and
//! routes each message to the receiver of its channel. When that connection
//! drops every receiver ends, and the next subscribe opens a fresh one.
//!
//! Leases are plain keys holding the owner token: `SET NX PX` takes one,
//! and renew and release run as scripts that compare the token first.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{RedisError, Script, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LeaseToken, SyncBackend};
use crate::error::{BackendError, BackendResult};

/// Extend the lease only if it still carries our token.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete the lease only if it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

type Routes = Arc<DashMap<String, mpsc::UnboundedSender<Vec<u8>>>>;

/// Live pub/sub connection.
struct Subscriber {
    sink: PubSubSink,
    generation: u64,
    dispatcher: JoinHandle<()>,
}

/// [`SyncBackend`] on a Redis server shared by every instance.
pub struct RedisBackend {
    client: redis::Client,
    commands: ConnectionManager,
    subscriber: Arc<Mutex<Option<Subscriber>>>,
    routes: Routes,
    generations: AtomicU64,
    renew: Script,
    release: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379`.
    ///
    /// Only the command connection is opened here; the pub/sub connection
    /// is opened by the first subscribe.
    pub async fn connect(url: &str) -> BackendResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let commands = client
            .get_connection_manager()
            .await
            .map_err(unavailable)?;
        info!(server = %client.get_connection_info().addr, "Connected to Redis");
        Ok(Self {
            client,
            commands,
            subscriber: Arc::new(Mutex::new(None)),
            routes: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Open the pub/sub connection unless one is live.
    async fn connected<'a>(
        &self,
        slot: &'a mut Option<Subscriber>,
    ) -> BackendResult<&'a mut Subscriber> {
        if slot
            .as_ref()
            .is_some_and(|subscriber| subscriber.dispatcher.is_finished())
        {
            *slot = None;
        }
        if slot.is_none() {
            let pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
            let (sink, messages) = pubsub.split();
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            let dispatcher = tokio::spawn(dispatch(
                messages,
                Arc::clone(&self.routes),
                Arc::downgrade(&self.subscriber),
                generation,
            ));
            debug!(generation, "Opened Redis pub/sub connection");
            *slot = Some(Subscriber {
                sink,
                generation,
                dispatcher,
            });
        }
        slot.as_mut().ok_or_else(|| BackendError::Unavailable {
            reason: "pub/sub connection missing".into(),
        })
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.subscriber.try_lock() {
            if let Some(subscriber) = slot.take() {
                subscriber.dispatcher.abort();
            }
        }
    }
}

#[async_trait]
impl SyncBackend for RedisBackend {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BackendResult<()> {
        let mut connection = self.commands.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_slice())
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<mpsc::UnboundedReceiver<Vec<u8>>> {
        let mut slot = self.subscriber.lock().await;
        let subscriber = self.connected(&mut slot).await?;

        // Route first so nothing published right after SUBSCRIBE is missed.
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(channel.to_string(), tx);
        if let Err(e) = subscriber.sink.subscribe(channel).await {
            self.routes.remove(channel);
            subscriber.dispatcher.abort();
            *slot = None;
            return Err(unavailable(e));
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> BackendResult<()> {
        self.routes.remove(channel);
        let mut slot = self.subscriber.lock().await;
        let Some(subscriber) = slot.as_mut() else {
            return Ok(());
        };
        subscriber
            .sink
            .unsubscribe(channel)
            .await
            .map_err(unavailable)
    }

    async fn acquire_lease(&self, key: &str, ttl: Duration) -> BackendResult<LeaseToken> {
        let lease = LeaseToken::generate(key);
        let mut connection = self.commands.clone();
        let reply: Value = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        if acquired(&reply) {
            Ok(lease)
        } else {
            Err(BackendError::LeaseBusy {
                key: key.to_string(),
            })
        }
    }

    async fn renew_lease(&self, lease: &LeaseToken, ttl: Duration) -> BackendResult<()> {
        let mut connection = self.commands.clone();
        let renewed: i64 = self
            .renew
            .key(&lease.key)
            .arg(&lease.value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;
        if renewed == 0 {
            return Err(BackendError::LeaseExpired {
                key: lease.key.clone(),
            });
        }
        Ok(())
    }

    async fn release_lease(&self, lease: &LeaseToken) -> BackendResult<()> {
        let mut connection = self.commands.clone();
        let _deleted: i64 = self
            .release
            .key(&lease.key)
            .arg(&lease.value)
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn ping(&self) -> BackendResult<()> {
        let mut connection = self.commands.clone();
        let _pong: Value = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

/// Route pub/sub messages until the connection ends.
async fn dispatch(
    messages: PubSubStream,
    routes: Routes,
    subscriber: Weak<Mutex<Option<Subscriber>>>,
    generation: u64,
) {
    tokio::pin!(messages);
    while let Some(message) = messages.next().await {
        if let Some(route) = routes.get(message.get_channel_name()) {
            let _ = route.send(message.get_payload_bytes().to_vec());
        }
    }

    warn!(generation, "Redis pub/sub connection closed");
    let Some(subscriber) = subscriber.upgrade() else {
        return;
    };
    let mut slot = subscriber.lock().await;
    if slot
        .as_ref()
        .is_some_and(|current| current.generation == generation)
    {
        *slot = None;
        // Ending every receiver tells subscribers to resubscribe.
        routes.clear();
    }
}

/// `SET NX` answers OK when it took the key and nil when the key exists.
fn acquired(reply: &Value) -> bool {
    !matches!(reply, Value::Nil)
}

/// Lease TTL in whole milliseconds, at least one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn unavailable(e: RedisError) -> BackendError {
    BackendError::Unavailable {
        reason: e.to_string(),
    }
}
