//! # Services
//!
//! User extensions that listen to the client.
//!
//! A [`Service`] declares listeners keyed by op code, wildcard or lifecycle
//! tag. Services are created by factories when the client is built. Each
//! factory gets a [`ClientHandle`], which reaches the client without owning
//! it.
//!
//! ## Components
//! - **Service**: listener provider
//! - **TcpServer**: serves TCP connections while the client runs
//! - **PacketLog**: logs every dispatched packet
//! - **Repeating**: interval work bound to the client, and the Heartbeat
//!   service built on it

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::context::ClientHandle;
use crate::protocol::registry::{Handler, ListenerKey};

pub mod packet_log;
pub mod tasks;
pub mod tcp;

pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Listeners to merge into the client's registry.
    fn listeners(self: Arc<Self>) -> Vec<(ListenerKey, Handler)>;
}

type ServiceFactory = Box<dyn FnOnce(ClientHandle) -> Arc<dyn Service> + Send>;

/// Service factories waiting for a client.
#[derive(Default)]
pub struct ServiceSet {
    factories: Vec<ServiceFactory>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, factory: F) -> &mut Self
    where
        F: FnOnce(ClientHandle) -> Arc<dyn Service> + Send + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    pub fn with<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(ClientHandle) -> Arc<dyn Service> + Send + 'static,
    {
        self.add(factory);
        self
    }

    pub fn merge(&mut self, other: ServiceSet) {
        self.factories.extend(other.factories);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiate every service for one client.
    pub fn load(self, handle: ClientHandle) -> LoadedServices {
        let mut loaded = LoadedServices::default();
        for factory in self.factories {
            let service = factory(handle);
            let listeners = Arc::clone(&service).listeners();
            debug!(
                service = service.name(),
                listeners = listeners.len(),
                "loaded service"
            );
            loaded.listeners.extend(listeners);
            loaded.services.push(service);
        }
        loaded
    }
}

impl fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSet")
            .field("factories", &self.factories.len())
            .finish()
    }
}

/// Instantiated services and the listeners they declared.
#[derive(Default)]
pub struct LoadedServices {
    pub services: Vec<Arc<dyn Service>>,
    pub listeners: Vec<(ListenerKey, Handler)>,
}
