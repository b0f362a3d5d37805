//! Servient
//!
//! The [`Servient`] owns the protocol bindings of a process, keyed by URI scheme, together with
//! the registry of the exposed Things. It drives the lifecycle of every binding:
//!
//! ```text
//! Idle --start--> Running --shutdown--> ShutDown
//! ```
//!
//! Several servients can live in the same process, they do not share any state.

use std::{collections::HashMap, fmt, sync::Arc, sync::Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    binding::{ProtocolClient, ProtocolClientFactory, ProtocolServer, ProtocolServerFactory},
    config::{Credentials, ServientConfig},
    consumed::ConsumedThing,
    content::ContentSerdes,
    error::{Error, Result},
    exposed::{ExposedThing, Lifecycle},
    thing::Thing,
};

/// Lifecycle of a [`Servient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServientState {
    Idle,
    Running,
    ShutDown,
}

impl ServientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::ShutDown => "shut down",
        }
    }
}

struct Inner {
    config: ServientConfig,
    codecs: Arc<ContentSerdes>,
    client_factories: RwLock<HashMap<String, Arc<dyn ProtocolClientFactory>>>,
    server_factories: RwLock<HashMap<String, Arc<dyn ProtocolServerFactory>>>,
    servers: RwLock<HashMap<String, Arc<dyn ProtocolServer>>>,
    // Clients handed out and still alive, stopped on shutdown
    clients: Mutex<Vec<Weak<dyn ProtocolClient>>>,
    things: RwLock<HashMap<String, Arc<ExposedThing>>>,
    credentials: RwLock<HashMap<String, Credentials>>,
    state: RwLock<ServientState>,
    // Serializes start and shutdown
    transition: tokio::sync::Mutex<()>,
}

/// Owner of the protocol bindings and of the exposed Things
///
/// Cloning a servient gives another handle to the same instance.
#[derive(Clone)]
pub struct Servient {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Servient`], held by the Things it produces.
#[derive(Clone)]
pub struct WeakServient(Weak<Inner>);

impl WeakServient {
    pub fn upgrade(&self) -> Option<Servient> {
        self.0.upgrade().map(|inner| Servient { inner })
    }
}

impl fmt::Debug for WeakServient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakServient")
    }
}

fn scheme_key(scheme: &str) -> String {
    scheme.to_ascii_lowercase()
}

impl Default for Servient {
    fn default() -> Self {
        Self::new()
    }
}

impl Servient {
    pub fn new() -> Self {
        Self::with_config(ServientConfig::default())
    }

    /// Create a servient using the credentials and flags of `config`.
    pub fn with_config(config: ServientConfig) -> Self {
        let credentials = config.credentials.clone();

        Self {
            inner: Arc::new(Inner {
                config,
                codecs: Arc::new(ContentSerdes::new()),
                client_factories: Default::default(),
                server_factories: Default::default(),
                servers: Default::default(),
                clients: Default::default(),
                things: Default::default(),
                credentials: RwLock::new(credentials),
                state: RwLock::new(ServientState::Idle),
                transition: Default::default(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakServient {
        WeakServient(Arc::downgrade(&self.inner))
    }

    #[inline]
    pub fn config(&self) -> &ServientConfig {
        &self.inner.config
    }

    /// The codecs shared by every binding of the servient.
    #[inline]
    pub fn codecs(&self) -> &Arc<ContentSerdes> {
        &self.inner.codecs
    }

    #[inline]
    pub fn state(&self) -> ServientState {
        *self.inner.state.read()
    }

    /// Register the client factory of `scheme`, replacing any previous one.
    pub fn register_client_factory(
        &self,
        scheme: &str,
        factory: Arc<dyn ProtocolClientFactory>,
    ) -> &Self {
        let scheme = scheme_key(scheme);
        if self
            .inner
            .client_factories
            .write()
            .insert(scheme.clone(), factory)
            .is_some()
        {
            debug!(%scheme, "client factory replaced");
        }
        self
    }

    /// Register a client factory under its own scheme.
    pub fn add_client_factory(&self, factory: Arc<dyn ProtocolClientFactory>) -> &Self {
        let scheme = factory.scheme().to_string();
        self.register_client_factory(&scheme, factory)
    }

    /// Register the server factory of `scheme`, replacing any previous one.
    ///
    /// Only the factories registered before [`Servient::start`] are started: a factory
    /// registered later is never started by this servient.
    pub fn register_server_factory(
        &self,
        scheme: &str,
        factory: Arc<dyn ProtocolServerFactory>,
    ) -> &Self {
        let scheme = scheme_key(scheme);
        if self
            .inner
            .server_factories
            .write()
            .insert(scheme.clone(), factory)
            .is_some()
        {
            debug!(%scheme, "server factory replaced");
        }
        self
    }

    /// Register a server factory under its own scheme.
    pub fn add_server_factory(&self, factory: Arc<dyn ProtocolServerFactory>) -> &Self {
        let scheme = factory.scheme().to_string();
        self.register_server_factory(&scheme, factory)
    }

    pub fn has_client_for(&self, scheme: &str) -> bool {
        self.inner
            .client_factories
            .read()
            .contains_key(&scheme_key(scheme))
    }

    /// The schemes with a registered client factory, sorted.
    pub fn client_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.inner.client_factories.read().keys().cloned().collect();
        schemes.sort_unstable();
        schemes
    }

    /// The schemes of the started servers, sorted.
    pub fn server_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.inner.servers.read().keys().cloned().collect();
        schemes.sort_unstable();
        schemes
    }

    /// Store the credentials of each Thing id, replacing existing ones.
    pub fn add_credentials(&self, credentials: impl IntoIterator<Item = (String, Credentials)>) {
        self.inner.credentials.write().extend(credentials);
    }

    pub fn credentials_for(&self, thing_id: &str) -> Option<Credentials> {
        self.inner.credentials.read().get(thing_id).cloned()
    }

    /// Start every registered server, unless the servient is client only, and initialize every
    /// client factory.
    ///
    /// Startup is best effort: a failing factory does not prevent the others from starting, all
    /// the failures are reported together as [`Error::Aggregate`]. The servient is running
    /// either way. Starting a running servient does nothing.
    ///
    /// Things exposed before the start are served by the started servers matching their
    /// schemes.
    pub async fn start(&self) -> Result<Wot> {
        let _transition = self.inner.transition.lock().await;
        match self.state() {
            ServientState::Running => return Ok(self.wot()),
            ServientState::ShutDown => return Err(self.lifecycle_error(ServientState::ShutDown)),
            ServientState::Idle => {}
        }

        let mut failures = Vec::new();
        if self.inner.config.servient.client_only {
            info!("client only servient, servers are not started");
        } else {
            let factories: Vec<_> = self
                .inner
                .server_factories
                .read()
                .iter()
                .map(|(scheme, factory)| (scheme.clone(), Arc::clone(factory)))
                .collect();

            for (scheme, factory) in factories {
                match self.start_server(factory.as_ref()).await {
                    Ok(server) => {
                        info!(%scheme, "server started");
                        self.inner
                            .servers
                            .write()
                            .insert(scheme.clone(), Arc::clone(&server));
                        failures.extend(self.serve_exposed_things(&scheme, &server).await);
                    }
                    Err(err) => {
                        warn!(%scheme, %err, "server failed to start");
                        failures.push((scheme, err));
                    }
                }
            }
        }

        let factories: Vec<_> = self
            .inner
            .client_factories
            .read()
            .iter()
            .map(|(scheme, factory)| (scheme.clone(), Arc::clone(factory)))
            .collect();
        for (scheme, factory) in factories {
            if let Err(err) = factory.init().await {
                warn!(%scheme, %err, "client factory failed to initialize");
                failures.push((scheme, err));
            }
        }

        *self.inner.state.write() = ServientState::Running;
        if failures.is_empty() {
            Ok(self.wot())
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    async fn serve_exposed_things(
        &self,
        scheme: &str,
        server: &Arc<dyn ProtocolServer>,
    ) -> Vec<(String, Error)> {
        let things: Vec<_> = self
            .inner
            .things
            .read()
            .values()
            .filter(|thing| thing.lifecycle() == Lifecycle::Exposed)
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for thing in things {
            let schemes = thing.description().schemes();
            if !schemes.is_empty() && !schemes.contains(scheme) {
                continue;
            }

            match server.expose(Arc::clone(&thing)).await {
                Ok(()) => debug!(thing = %thing.title(), %scheme, "thing exposed on server"),
                Err(err) => {
                    warn!(thing = %thing.title(), %scheme, %err, "server failed to expose thing");
                    failures.push((scheme.to_string(), err));
                }
            }
        }

        failures
    }

    async fn start_server(&self, factory: &dyn ProtocolServerFactory) -> Result<Arc<dyn ProtocolServer>> {
        let server = factory.create(Arc::clone(&self.inner.codecs)).await?;
        server.start().await?;
        Ok(server)
    }

    /// A handle to produce and consume Things.
    pub fn wot(&self) -> Wot {
        Wot {
            servient: self.clone(),
        }
    }

    /// Create an exposed Thing owned by this servient.
    ///
    /// The Thing is registered but not exposed yet.
    pub fn produce(&self, td: Thing) -> Result<Arc<ExposedThing>> {
        self.ensure_not_shut_down()?;
        let thing = Arc::new(ExposedThing::with_servient(td, self.downgrade()));
        self.add_thing(Arc::clone(&thing))?;

        Ok(thing)
    }

    /// Register an exposed Thing, its id must be unique.
    pub fn add_thing(&self, thing: Arc<ExposedThing>) -> Result<()> {
        let mut things = self.inner.things.write();
        if things.contains_key(thing.id()) {
            return Err(Error::DuplicateThing(thing.id().to_string()));
        }

        debug!(thing = %thing.title(), id = %thing.id(), "thing registered");
        things.insert(thing.id().to_string(), thing);
        Ok(())
    }

    pub fn things(&self) -> Vec<Arc<ExposedThing>> {
        self.inner.things.read().values().cloned().collect()
    }

    pub fn thing(&self, id: &str) -> Option<Arc<ExposedThing>> {
        self.inner.things.read().get(id).cloned()
    }

    /// Route the requests of every started server matching the schemes of the Thing to it.
    ///
    /// A Thing whose forms declare no scheme is exposed through every server. The Thing is
    /// registered first if needed.
    pub async fn expose(&self, thing: &Arc<ExposedThing>) -> Result<()> {
        self.ensure_not_shut_down()?;
        {
            let mut things = self.inner.things.write();
            match things.get(thing.id()) {
                Some(registered) if !Arc::ptr_eq(registered, thing) => {
                    return Err(Error::DuplicateThing(thing.id().to_string()))
                }
                Some(_) => {}
                None => {
                    things.insert(thing.id().to_string(), Arc::clone(thing));
                }
            }
        }

        let schemes = thing.description().schemes();
        let servers: Vec<_> = self
            .inner
            .servers
            .read()
            .iter()
            .filter(|(scheme, _)| schemes.is_empty() || schemes.contains(*scheme))
            .map(|(scheme, server)| (scheme.clone(), Arc::clone(server)))
            .collect();

        let mut failures = Vec::new();
        for (scheme, server) in servers {
            match server.expose(Arc::clone(thing)).await {
                Ok(()) => debug!(thing = %thing.title(), %scheme, "thing exposed on server"),
                Err(err) => failures.push((scheme, err)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    /// Withdraw a Thing from every server and from the registry, and destroy it.
    ///
    /// Returns whether the Thing was registered.
    pub async fn destroy_thing(&self, id: &str) -> Result<bool> {
        let thing = self.inner.things.write().remove(id);
        let Some(thing) = thing else {
            return Ok(false);
        };

        let servers: Vec<_> = self
            .inner
            .servers
            .read()
            .iter()
            .map(|(scheme, server)| (scheme.clone(), Arc::clone(server)))
            .collect();

        let mut failures = Vec::new();
        for (scheme, server) in servers {
            if let Err(err) = server.destroy(id).await {
                failures.push((scheme, err));
            }
        }
        thing.teardown();

        if failures.is_empty() {
            Ok(true)
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    /// A client of the factory registered for `scheme`.
    ///
    /// The servient stops the client on shutdown if it is still in use by then.
    pub fn get_client_for(&self, scheme: &str) -> Result<Arc<dyn ProtocolClient>> {
        self.ensure_not_shut_down()?;
        let scheme = scheme_key(scheme);
        let factory = self
            .inner
            .client_factories
            .read()
            .get(&scheme)
            .cloned()
            .ok_or_else(|| Error::UnsupportedScheme(scheme.clone()))?;

        let client = factory.client()?;
        debug!(%scheme, "client created");
        let mut clients = self.inner.clients.lock();
        clients.retain(|client| client.strong_count() > 0);
        clients.push(Arc::downgrade(&client));
        drop(clients);

        Ok(client)
    }

    /// Stop every server and client, release every client factory and destroy the exposed
    /// Things.
    ///
    /// Teardown is best effort, all the failures are reported together. Shutting down again is
    /// a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let _transition = self.inner.transition.lock().await;
        if self.state() == ServientState::ShutDown {
            return Ok(());
        }
        *self.inner.state.write() = ServientState::ShutDown;
        info!("shutting down servient");

        let mut failures = Vec::new();

        let things: Vec<_> = self.inner.things.write().drain().map(|(_, t)| t).collect();
        for thing in things {
            thing.teardown();
        }

        let servers: Vec<_> = self.inner.servers.write().drain().collect();
        for (scheme, server) in servers {
            if let Err(err) = server.stop().await {
                warn!(%scheme, %err, "server failed to stop");
                failures.push((scheme, err));
            }
        }

        let clients: Vec<_> = self
            .inner
            .clients
            .lock()
            .drain(..)
            .filter_map(|client| client.upgrade())
            .collect();
        for client in clients {
            if let Err(err) = client.stop().await {
                warn!(%err, "client failed to stop");
                failures.push(("client".to_string(), err));
            }
        }

        let factories: Vec<_> = self
            .inner
            .client_factories
            .read()
            .iter()
            .map(|(scheme, factory)| (scheme.clone(), Arc::clone(factory)))
            .collect();
        for (scheme, factory) in factories {
            if let Err(err) = factory.destroy().await {
                warn!(%scheme, %err, "client factory failed to shut down");
                failures.push((scheme, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    fn ensure_not_shut_down(&self) -> Result<()> {
        match self.state() {
            ServientState::ShutDown => Err(self.lifecycle_error(ServientState::ShutDown)),
            _ => Ok(()),
        }
    }

    fn lifecycle_error(&self, state: ServientState) -> Error {
        Error::Lifecycle {
            target: "Servient".to_string(),
            state: state.as_str(),
        }
    }
}

impl fmt::Debug for Servient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servient")
            .field("state", &self.state())
            .field("client_schemes", &self.client_schemes())
            .field("server_schemes", &self.server_schemes())
            .field("things", &self.inner.things.read().len())
            .finish()
    }
}

/// Entry point of the scripting API, returned by [`Servient::start`].
#[derive(Clone, Debug)]
pub struct Wot {
    servient: Servient,
}

impl Wot {
    #[inline]
    pub fn servient(&self) -> &Servient {
        &self.servient
    }

    /// Create an exposed Thing from a description, see [`Servient::produce`].
    pub fn produce(&self, td: Thing) -> Result<Arc<ExposedThing>> {
        self.servient.produce(td)
    }

    /// Create a proxy of the remote Thing described by `td`.
    pub fn consume(&self, td: Thing) -> ConsumedThing {
        ConsumedThing::new(self.servient.clone(), td)
    }
}
