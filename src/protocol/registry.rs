use futures::future::BoxFuture;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

use crate::core::opcode::OpCode;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::tasks::TaskSpawner;

/// Lifecycle broadcast tags.
pub mod tags {
    pub const STARTING: &str = "starting";
    pub const CONNECTED: &str = "connected";
    pub const ALIVE: &str = "alive";
    pub const ERROR: &str = "error";
}

/// Dispatch key a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    /// Packets with this op code
    Op(OpCode),
    /// Every packet dispatch
    Any,
    /// A lifecycle broadcast unrelated to packets
    Tag(Cow<'static, str>),
}

impl ListenerKey {
    pub fn tag(name: impl Into<Cow<'static, str>>) -> Self {
        ListenerKey::Tag(name.into())
    }
}

impl From<OpCode> for ListenerKey {
    fn from(op: OpCode) -> Self {
        ListenerKey::Op(op)
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKey::Op(op) => write!(f, "op:{op}"),
            ListenerKey::Any => f.write_str("*"),
            ListenerKey::Tag(tag) => write!(f, "tag:{tag}"),
        }
    }
}

/// What a handler is invoked with.
#[derive(Debug, Clone)]
pub enum Event {
    Packet(Packet),
    /// A lifecycle tag with no payload
    Signal,
    Error(Arc<ProtocolError>),
}

pub type HandlerFuture = BoxFuture<'static, Result<()>>;
type HandlerFn = dyn Fn(Event) -> HandlerFuture + Send + Sync + 'static;

/// A registered listener. Cheap to clone.
#[derive(Clone)]
pub struct Handler {
    f: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |event: Event| -> HandlerFuture { Box::pin(f(event)) }),
        }
    }

    /// A handler that only runs for packet events.
    pub fn packet<F, Fut>(f: F) -> Self
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |event: Event| -> HandlerFuture {
                match event {
                    Event::Packet(packet) => Box::pin(f(packet)),
                    _ => Box::pin(async { Ok::<(), ProtocolError>(()) }),
                }
            }),
        }
    }

    /// A handler that takes no arguments, for lifecycle tags.
    pub fn signal<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |_: Event| -> HandlerFuture { Box::pin(f()) }),
        }
    }

    /// A handler for the `error` tag.
    pub fn error<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<ProtocolError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |event: Event| -> HandlerFuture {
                match event {
                    Event::Error(error) => Box::pin(f(error)),
                    _ => Box::pin(async { Ok::<(), ProtocolError>(()) }),
                }
            }),
        }
    }

    pub fn call(&self, event: Event) -> HandlerFuture {
        (self.f)(event)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listeners = HashMap<ListenerKey, Vec<(ListenerId, Handler)>>;

/// Listener registry with per-key handler lists kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    handlers: Arc<RwLock<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<ListenerKey>, handler: Handler) -> Result<ListenerId> {
        self.register_with(key, |_| handler)
    }

    /// Register a handler that needs to know its own id, e.g. to remove
    /// itself after the first matching event.
    pub fn register_with<F>(&self, key: impl Into<ListenerKey>, make: F) -> Result<ListenerId>
    where
        F: FnOnce(ListenerId) -> Handler,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler = make(id);

        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_WRITE_LOCK))?;
        handlers.entry(key.into()).or_default().push((id, handler));
        Ok(id)
    }

    /// Remove one handler. Returns `Ok(false)` if it was already gone, so
    /// that of several racing callers exactly one sees `true`.
    pub fn unregister(&self, key: &ListenerKey, id: ListenerId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_WRITE_LOCK))?;
        let Some(list) = handlers.get_mut(key) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        Ok(list.len() != before)
    }

    pub fn extend<I>(&self, listeners: I) -> Result<()>
    where
        I: IntoIterator<Item = (ListenerKey, Handler)>,
    {
        for (key, handler) in listeners {
            self.register(key, handler)?;
        }
        Ok(())
    }

    /// Handlers for a key. Op code keys also match wildcard handlers.
    pub fn handlers_for(&self, key: &ListenerKey) -> Result<Vec<Handler>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REGISTRY_READ_LOCK))?;

        let direct = handlers.get(key).into_iter().flatten();
        let wildcard = match key {
            ListenerKey::Op(_) => handlers.get(&ListenerKey::Any),
            _ => None,
        };
        Ok(direct
            .chain(wildcard.into_iter().flatten())
            .map(|(_, handler)| handler.clone())
            .collect())
    }

    pub fn count(&self, key: &ListenerKey) -> usize {
        self.handlers_for(key).map(|h| h.len()).unwrap_or(0)
    }

    /// Spawn every handler for `key` as its own task. Returns how many were
    /// scheduled. Handler errors and panics are contained by the spawner.
    pub fn dispatch(&self, key: &ListenerKey, event: Event, spawner: &TaskSpawner) -> Result<usize> {
        let handlers = self.handlers_for(key)?;
        trace!(listener = %key, count = handlers.len(), "dispatching");
        for handler in &handlers {
            spawner.spawn_handler(key.to_string(), handler.call(event.clone()));
        }
        Ok(handlers.len())
    }
}
