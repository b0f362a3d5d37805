//! Protocol binding contracts
//!
//! A protocol binding plugs a transport into the servient through four traits:
//!
//! - a [`ProtocolClientFactory`] builds [`ProtocolClient`]s used by consumed Things;
//! - a [`ProtocolServerFactory`] builds the [`ProtocolServer`] serving exposed Things.
//!
//! Factories own every shared transport resource (sockets, broker connections), Things never
//! hold any. Every value crossing the boundary is a [`Content`].
//!
//! Servers usually dispatch inbound requests through a [`Router`], which maps them onto the
//! [`ExposedThing`] operations and applies the matching codec in both directions.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    config::Credentials,
    content::{Content, ContentSerdes},
    error::{Error, InteractionKind, Result},
    exposed::ExposedThing,
    interaction::{Listener, Subscription},
    thing::{DataSchema, Form, FormOperation, SecurityScheme},
};

/// Callback receiving the payloads of a remote observation or subscription.
pub type ContentListener = Arc<dyn Fn(Content) + Send + Sync>;

/// Transport used by consumed Things.
///
/// Forms given to a client always carry an absolute href.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn read_resource(&self, form: &Form) -> Result<Content>;

    async fn write_resource(&self, form: &Form, content: Content) -> Result<()>;

    async fn invoke_resource(&self, form: &Form, content: Option<Content>) -> Result<Content>;

    /// Drop any server-side state bound to the resource, such as an observation.
    async fn unlink_resource(&self, form: &Form) -> Result<()>;

    /// Deliver every update of the resource to `on_update` until the subscription is cancelled.
    async fn subscribe_resource(
        &self,
        form: &Form,
        on_update: ContentListener,
    ) -> Result<Subscription>;

    /// Release the resources held by this client.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Configure the security of the following requests.
    ///
    /// Returns `false` when none of the schemes can be satisfied with the given credentials.
    fn set_security(&self, schemes: &[SecurityScheme], credentials: Option<&Credentials>) -> bool;
}

/// Builds clients for one URI scheme.
#[async_trait]
pub trait ProtocolClientFactory: Send + Sync {
    /// The lower-case URI scheme served by the factory.
    fn scheme(&self) -> &str;

    /// Prepare the shared resources, called once when the servient starts.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn ProtocolClient>>;

    /// Release the shared resources, called once on shutdown.
    async fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

/// Makes exposed Things reachable over one transport.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    fn scheme(&self) -> &str;

    /// Start listening.
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Route requests to `thing`.
    ///
    /// Servers usually advertise themselves by adding their forms to the Thing, see
    /// [`ExposedThing::add_form`].
    async fn expose(&self, thing: Arc<ExposedThing>) -> Result<()>;

    /// Stop routing requests to the Thing, returning whether it was exposed.
    async fn destroy(&self, thing_id: &str) -> Result<bool>;
}

/// Builds the server of one URI scheme.
#[async_trait]
pub trait ProtocolServerFactory: Send + Sync {
    fn scheme(&self) -> &str;

    /// Create a server that is not started yet.
    ///
    /// The server must encode and decode payloads through `codecs`.
    async fn create(&self, codecs: Arc<ContentSerdes>) -> Result<Arc<dyn ProtocolServer>>;
}

/// An inbound request, after the protocol specific parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub thing_id: String,
    pub op: FormOperation,
    /// The interaction name, absent for Thing-level operations
    pub name: Option<String>,
    pub content: Option<Content>,
    /// The content type of the response, `application/json` by default
    pub accept: Option<String>,
}

impl Request {
    pub fn new(thing_id: impl Into<String>, op: FormOperation) -> Self {
        Self {
            thing_id: thing_id.into(),
            op,
            name: None,
            content: None,
            accept: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }
}

/// Dispatch of inbound requests to exposed Things, keyed by Thing id.
///
/// Cloning a router gives another handle to the same routing table.
#[derive(Clone)]
pub struct Router {
    things: Arc<RwLock<HashMap<String, Arc<ExposedThing>>>>,
    codecs: Arc<ContentSerdes>,
}

impl Router {
    pub fn new(codecs: Arc<ContentSerdes>) -> Self {
        Self {
            things: Default::default(),
            codecs,
        }
    }

    #[inline]
    pub fn codecs(&self) -> &Arc<ContentSerdes> {
        &self.codecs
    }

    /// Route the requests for the id of `thing` to it, replacing any previous Thing.
    pub fn insert(&self, thing: Arc<ExposedThing>) {
        self.things.write().insert(thing.id().to_string(), thing);
    }

    pub fn remove(&self, thing_id: &str) -> Option<Arc<ExposedThing>> {
        self.things.write().remove(thing_id)
    }

    pub fn get(&self, thing_id: &str) -> Option<Arc<ExposedThing>> {
        self.things.read().get(thing_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.things.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn thing(&self, thing_id: &str) -> Result<Arc<ExposedThing>> {
        self.get(thing_id)
            .ok_or_else(|| Error::UnknownThing(thing_id.to_string()))
    }

    fn decode(&self, request: &Request, schema: Option<&DataSchema>) -> Result<Option<Value>> {
        request
            .content
            .as_ref()
            .map(|content| self.codecs.content_to_value(content, schema))
            .transpose()
    }

    fn encode(&self, request: &Request, value: &Value, schema: Option<&DataSchema>) -> Result<Content> {
        self.codecs
            .value_to_content(value, schema, request.accept.as_deref())
    }

    /// Serve a one-shot request, returning the response payload if the operation has one.
    ///
    /// Observation and subscription requests go through [`Router::subscribe`].
    pub async fn dispatch(&self, request: Request) -> Result<Option<Content>> {
        use FormOperation::*;

        let thing = self.thing(&request.thing_id)?;
        let forbidden = |name: &str| Error::Forbidden {
            thing: thing.title().to_string(),
            name: name.to_string(),
            op: request.op,
        };
        debug!(thing = %thing.title(), op = %request.op, name = ?request.name, "dispatching request");

        match request.op {
            ReadProperty => {
                let name = required_name(&request)?;
                let affordance = thing.property(name)?;
                if affordance.data_schema.write_only {
                    return Err(forbidden(name));
                }

                let value = thing.read_property(name).await?;
                self.encode(&request, &value, Some(&affordance.data_schema))
                    .map(Some)
            }

            WriteProperty => {
                let name = required_name(&request)?;
                let affordance = thing.property(name)?;
                if affordance.data_schema.read_only {
                    return Err(forbidden(name));
                }

                let value = self
                    .decode(&request, Some(&affordance.data_schema))?
                    .ok_or_else(|| Error::Codec {
                        media_type: content_type(&request),
                        reason: format!("operation {} requires a payload", request.op),
                    })?;
                thing.write_property(name, value).await?;
                Ok(None)
            }

            InvokeAction => {
                let name = required_name(&request)?;
                let affordance = thing.action(name)?;
                let input = self.decode(&request, affordance.input.as_ref())?;

                let output = thing.invoke_action(name, input).await?;
                self.encode(&request, &output, affordance.output.as_ref())
                    .map(Some)
            }

            ReadAllProperties | ReadMultipleProperties => {
                let names = match request.op {
                    ReadAllProperties => thing
                        .names(InteractionKind::Property)
                        .into_iter()
                        .filter(|name| thing.is_readable(name).unwrap_or(false))
                        .collect(),
                    _ => requested_names(self.decode(&request, None)?)?,
                };
                for name in &names {
                    if !thing.is_readable(name)? {
                        return Err(forbidden(name));
                    }
                }

                let values: Map<String, Value> = thing
                    .read_multiple_properties(names)
                    .await?
                    .into_iter()
                    .collect();
                self.encode(&request, &Value::Object(values), None)
                    .map(Some)
            }

            WriteAllProperties | WriteMultipleProperties => {
                let values = match self.decode(&request, None)? {
                    Some(Value::Object(values)) => values,
                    _ => {
                        return Err(Error::Codec {
                            media_type: content_type(&request),
                            reason: "expected an object of property values".to_string(),
                        })
                    }
                };
                for name in values.keys() {
                    if !thing.is_writable(name)? {
                        return Err(forbidden(name));
                    }
                }

                thing.write_multiple_properties(values).await?;
                Ok(None)
            }

            op => {
                warn!(thing = %thing.title(), %op, "unsupported one-shot operation");
                Err(forbidden(request.name.as_deref().unwrap_or_default()))
            }
        }
    }

    /// Serve an `observeproperty` or `subscribeevent` request.
    ///
    /// Every change or event is encoded and handed to `on_content`.
    pub fn subscribe(&self, request: &Request, on_content: ContentListener) -> Result<Subscription> {
        let thing = self.thing(&request.thing_id)?;
        let name = required_name(request)?;
        let codecs = Arc::clone(&self.codecs);
        let accept = request.accept.clone();

        let (schema, subscribe): (_, fn(&ExposedThing, &str, Listener) -> Result<Subscription>) =
            match request.op {
                FormOperation::ObserveProperty => {
                    let affordance = thing.property(name)?;
                    (
                        Some(affordance.data_schema),
                        ExposedThing::observe_property,
                    )
                }
                FormOperation::SubscribeEvent => {
                    (thing.event(name)?.data, ExposedThing::subscribe_event)
                }
                op => {
                    return Err(Error::Forbidden {
                        thing: thing.title().to_string(),
                        name: name.to_string(),
                        op,
                    })
                }
            };

        let listener: Listener = Arc::new(move |value: &Value| {
            match codecs.value_to_content(value, schema.as_ref(), accept.as_deref()) {
                Ok(content) => on_content(content),
                Err(err) => warn!(%err, "cannot encode notification"),
            }
        });

        subscribe(thing.as_ref(), name, listener)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let things = self.things.read();
        f.debug_struct("Router")
            .field("things", &things.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn required_name(request: &Request) -> Result<&str> {
    request.name.as_deref().ok_or_else(|| Error::Codec {
        media_type: content_type(request),
        reason: format!("operation {} requires an interaction name", request.op),
    })
}

fn content_type(request: &Request) -> String {
    request
        .content
        .as_ref()
        .map(|content| content.content_type.clone())
        .unwrap_or_default()
}

fn requested_names(value: Option<Value>) -> Result<Vec<String>> {
    let invalid = || Error::Codec {
        media_type: crate::content::JSON.to_string(),
        reason: "expected an array of property names".to_string(),
    };

    match value {
        Some(Value::Array(names)) => names
            .into_iter()
            .map(|name| match name {
                Value::String(name) => Ok(name),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        content::{JSON, TEXT},
        thing::{ActionAffordance, EventAffordance, PropertyAffordance, Thing},
    };

    fn json_content(value: Value) -> Content {
        Content::new(JSON, serde_json::to_vec(&value).unwrap())
    }

    fn lamp(id: &str) -> Arc<ExposedThing> {
        let mut td = Thing::new("Lamp");
        td.id = Some(id.to_string());

        let thing = ExposedThing::new(td);
        thing
            .add_property("brightness", PropertyAffordance::default(), json!(10))
            .unwrap();
        thing
            .add_property(
                "model",
                PropertyAffordance {
                    data_schema: DataSchema {
                        read_only: true,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                json!("L-1"),
            )
            .unwrap();
        thing
            .add_action("toggle", ActionAffordance::default())
            .unwrap();
        thing
            .set_action_handler("toggle", |input, _ctx| async move {
                Ok(json!({ "received": input }))
            })
            .unwrap();
        thing
            .add_event("overheat", EventAffordance::default())
            .unwrap();

        Arc::new(thing)
    }

    fn router() -> Router {
        let router = Router::new(Arc::new(ContentSerdes::new()));
        router.insert(lamp("urn:dev:lamp-1"));
        router.insert(lamp("urn:dev:lamp-2"));
        router
    }

    #[tokio::test]
    async fn read_and_write_property() {
        let router = router();

        router
            .dispatch(
                Request::new("urn:dev:lamp-1", FormOperation::WriteProperty)
                    .with_name("brightness")
                    .with_content(json_content(json!(80))),
            )
            .await
            .unwrap();

        let content = router
            .dispatch(
                Request::new("urn:dev:lamp-1", FormOperation::ReadProperty)
                    .with_name("brightness")
                    .with_accept(TEXT),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content, Content::new(TEXT, "80"));

        // routing is keyed by Thing id
        let other = router.get("urn:dev:lamp-2").unwrap();
        assert_eq!(other.read_property("brightness").await.unwrap(), json!(10));
    }

    #[tokio::test]
    async fn read_only_is_enforced_for_peers() {
        let router = router();

        let err = router
            .dispatch(
                Request::new("urn:dev:lamp-1", FormOperation::WriteProperty)
                    .with_name("model")
                    .with_content(json_content(json!("hacked"))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { ref name, .. } if name == "model"));

        let err = router
            .dispatch(
                Request::new("urn:dev:lamp-1", FormOperation::WriteMultipleProperties)
                    .with_content(json_content(json!({ "brightness": 1, "model": "x" }))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
    }

    #[tokio::test]
    async fn write_without_payload_is_rejected() {
        let router = router();

        let err = router
            .dispatch(
                Request::new("urn:dev:lamp-1", FormOperation::WriteProperty).with_name("brightness"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Codec { .. }));

        let thing = router.get("urn:dev:lamp-1").unwrap();
        assert_eq!(thing.read_property("brightness").await.unwrap(), json!(10));
    }

    #[tokio::test]
    async fn invoke_action() {
        let router = router();

        let content = router
            .dispatch(
                Request::new("urn:dev:lamp-2", FormOperation::InvokeAction)
                    .with_name("toggle")
                    .with_content(json_content(json!(true))),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            serde_json::from_slice::<Value>(&content.body).unwrap(),
            json!({ "received": true })
        );
    }

    #[tokio::test]
    async fn read_multiple_properties() {
        let router = router();

        let content = router
            .dispatch(
                Request::new("urn:dev:lamp-1", FormOperation::ReadMultipleProperties)
                    .with_content(json_content(json!(["brightness", "model"]))),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&content.body).unwrap(),
            json!({ "brightness": 10, "model": "L-1" })
        );

        let content = router
            .dispatch(Request::new("urn:dev:lamp-1", FormOperation::ReadAllProperties))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&content.body).unwrap(),
            json!({ "brightness": 10, "model": "L-1" })
        );
    }

    #[tokio::test]
    async fn unknown_thing_and_missing_name() {
        let router = router();

        assert!(matches!(
            router
                .dispatch(Request::new("urn:dev:nope", FormOperation::ReadProperty))
                .await,
            Err(Error::UnknownThing(id)) if id == "urn:dev:nope"
        ));
        assert!(matches!(
            router
                .dispatch(Request::new("urn:dev:lamp-1", FormOperation::ReadProperty))
                .await,
            Err(Error::Codec { .. })
        ));
        assert!(router.remove("urn:dev:lamp-1").is_some());
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn observe_encodes_changes() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let sub = router
            .subscribe(
                &Request::new("urn:dev:lamp-1", FormOperation::ObserveProperty)
                    .with_name("brightness"),
                Arc::new(move |content| sink.lock().push(content)),
            )
            .unwrap();

        let thing = router.get("urn:dev:lamp-1").unwrap();
        thing.write_property("brightness", json!(42)).await.unwrap();
        sub.unsubscribe();
        thing.write_property("brightness", json!(43)).await.unwrap();

        assert_eq!(*seen.lock(), vec![Content::new(JSON, "42")]);
    }

    #[test]
    fn subscribe_event() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let _sub = router
            .subscribe(
                &Request::new("urn:dev:lamp-2", FormOperation::SubscribeEvent)
                    .with_name("overheat"),
                Arc::new(move |content| sink.lock().push(content)),
            )
            .unwrap();
        router
            .get("urn:dev:lamp-2")
            .unwrap()
            .emit_event("overheat", json!("hot"))
            .unwrap();

        assert_eq!(*seen.lock(), vec![Content::new(JSON, "\"hot\"")]);

        assert!(matches!(
            router.subscribe(
                &Request::new("urn:dev:lamp-2", FormOperation::InvokeAction).with_name("toggle"),
                Arc::new(|_| ()),
            ),
            Err(Error::Forbidden { .. })
        ));
    }
}
