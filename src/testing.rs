//! In-process protocol binding for tests
//!
//! The `loop` scheme connects the clients and the server created from the same
//! [`LoopbackNetwork`] without any socket. Forms look like
//! `loop://local/<thing id>/<properties|actions|events>/<name>`.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::{
    binding::{
        ContentListener, ProtocolClient, ProtocolClientFactory, ProtocolServer,
        ProtocolServerFactory, Request, Router,
    },
    config::Credentials,
    content::{Content, ContentSerdes},
    error::{Error, InteractionKind, Result},
    exposed::ExposedThing,
    interaction::Subscription,
    thing::{Form, FormOperation, SecurityScheme},
};

pub const SCHEME: &str = "loop";

#[derive(Default)]
struct Shared {
    router: Mutex<Option<Router>>,
    listening: AtomicBool,
    clients_created: AtomicUsize,
    stopped_clients: AtomicUsize,
    security: Mutex<Option<(Vec<SecurityScheme>, Option<Credentials>)>>,
}

/// Links the loopback clients to the loopback server.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    shared: Arc<Shared>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_factory(&self) -> Arc<LoopbackServerFactory> {
        Arc::new(LoopbackServerFactory {
            network: self.clone(),
        })
    }

    pub fn client_factory(&self) -> Arc<LoopbackClientFactory> {
        Arc::new(LoopbackClientFactory {
            network: self.clone(),
        })
    }

    /// The routing table of the server.
    pub fn router(&self) -> Router {
        self.shared
            .router
            .lock()
            .clone()
            .expect("loopback server not created")
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    pub fn clients_created(&self) -> usize {
        self.shared.clients_created.load(Ordering::SeqCst)
    }

    pub fn stopped_clients(&self) -> usize {
        self.shared.stopped_clients.load(Ordering::SeqCst)
    }

    /// The last security configuration received by a client.
    pub fn security(&self) -> Option<(Vec<SecurityScheme>, Option<Credentials>)> {
        self.shared.security.lock().clone()
    }

    fn listening_router(&self) -> Result<Router> {
        let router = self.shared.router.lock().clone();
        match router {
            Some(router) if self.is_listening() => Ok(router),
            _ => Err(Error::transport("connection refused")),
        }
    }
}

pub struct LoopbackServerFactory {
    network: LoopbackNetwork,
}

#[async_trait]
impl ProtocolServerFactory for LoopbackServerFactory {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn create(&self, codecs: Arc<ContentSerdes>) -> Result<Arc<dyn ProtocolServer>> {
        let router = Router::new(codecs);
        *self.network.shared.router.lock() = Some(router.clone());

        Ok(Arc::new(LoopbackServer {
            network: self.network.clone(),
            router,
        }))
    }
}

pub struct LoopbackServer {
    network: LoopbackNetwork,
    router: Router,
}

fn href(thing_id: &str, kind: InteractionKind, name: &str) -> String {
    let segment = match kind {
        InteractionKind::Property => "properties",
        InteractionKind::Action => "actions",
        InteractionKind::Event => "events",
    };
    format!("{SCHEME}://local/{thing_id}/{segment}/{name}")
}

#[async_trait]
impl ProtocolServer for LoopbackServer {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn start(&self) -> Result<()> {
        self.network.shared.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.network.shared.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn expose(&self, thing: Arc<ExposedThing>) -> Result<()> {
        if self.router.get(thing.id()).is_some() {
            return Ok(());
        }

        for kind in [
            InteractionKind::Property,
            InteractionKind::Action,
            InteractionKind::Event,
        ] {
            for name in thing.names(kind) {
                thing.add_form(kind, &name, Form::new(href(thing.id(), kind, &name)))?;
            }
        }
        self.router.insert(thing);

        Ok(())
    }

    async fn destroy(&self, thing_id: &str) -> Result<bool> {
        Ok(self.router.remove(thing_id).is_some())
    }
}

/// A server that never starts.
pub struct FailingServerFactory;

#[async_trait]
impl ProtocolServerFactory for FailingServerFactory {
    fn scheme(&self) -> &str {
        "broken"
    }

    async fn create(&self, _codecs: Arc<ContentSerdes>) -> Result<Arc<dyn ProtocolServer>> {
        Err(Error::transport("address already in use"))
    }
}

/// A server that starts but refuses to serve any Thing.
pub struct RejectingServerFactory;

#[async_trait]
impl ProtocolServerFactory for RejectingServerFactory {
    fn scheme(&self) -> &str {
        "reject"
    }

    async fn create(&self, _codecs: Arc<ContentSerdes>) -> Result<Arc<dyn ProtocolServer>> {
        Ok(Arc::new(RejectingServer))
    }
}

pub struct RejectingServer;

#[async_trait]
impl ProtocolServer for RejectingServer {
    fn scheme(&self) -> &str {
        "reject"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn expose(&self, thing: Arc<ExposedThing>) -> Result<()> {
        Err(Error::transport(format!("cannot serve {}", thing.id())))
    }

    async fn destroy(&self, _thing_id: &str) -> Result<bool> {
        Ok(false)
    }
}

pub struct LoopbackClientFactory {
    network: LoopbackNetwork,
}

#[async_trait]
impl ProtocolClientFactory for LoopbackClientFactory {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn client(&self) -> Result<Arc<dyn ProtocolClient>> {
        self.network
            .shared
            .clients_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(LoopbackClient {
            network: self.network.clone(),
        }))
    }
}

pub struct LoopbackClient {
    network: LoopbackNetwork,
}

impl LoopbackClient {
    fn request(&self, form: &Form, op: FormOperation) -> Result<Request> {
        let url = Url::parse(&form.href).map_err(Error::transport)?;
        let segments: Vec<_> = url
            .path_segments()
            .map(|segments| segments.collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [thing_id, _, name] => Ok(Request::new(*thing_id, op)
                .with_name(*name)
                .with_accept(form.content_type_or_default())),
            _ => Err(Error::transport(format!("bad loopback href {}", form.href))),
        }
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn read_resource(&self, form: &Form) -> Result<Content> {
        let request = self.request(form, FormOperation::ReadProperty)?;
        self.network
            .listening_router()?
            .dispatch(request)
            .await
            .map_err(Error::transport)?
            .ok_or_else(|| Error::transport("empty response"))
    }

    async fn write_resource(&self, form: &Form, content: Content) -> Result<()> {
        let request = self
            .request(form, FormOperation::WriteProperty)?
            .with_content(content);
        self.network
            .listening_router()?
            .dispatch(request)
            .await
            .map_err(Error::transport)?;

        Ok(())
    }

    async fn invoke_resource(&self, form: &Form, content: Option<Content>) -> Result<Content> {
        let mut request = self.request(form, FormOperation::InvokeAction)?;
        request.content = content;
        self.network
            .listening_router()?
            .dispatch(request)
            .await
            .map_err(Error::transport)?
            .ok_or_else(|| Error::transport("empty response"))
    }

    async fn unlink_resource(&self, _form: &Form) -> Result<()> {
        Ok(())
    }

    async fn subscribe_resource(
        &self,
        form: &Form,
        on_update: ContentListener,
    ) -> Result<Subscription> {
        let op = if form.href.contains("/events/") {
            FormOperation::SubscribeEvent
        } else {
            FormOperation::ObserveProperty
        };
        let request = self.request(form, op)?;

        self.network
            .listening_router()?
            .subscribe(&request, on_update)
            .map_err(Error::transport)
    }

    async fn stop(&self) -> Result<()> {
        self.network
            .shared
            .stopped_clients
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_security(&self, schemes: &[SecurityScheme], credentials: Option<&Credentials>) -> bool {
        *self.network.shared.security.lock() = Some((schemes.to_vec(), credentials.cloned()));
        schemes.iter().all(SecurityScheme::is_nosec) || credentials.is_some()
    }
}
