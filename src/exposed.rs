//! Exposed Thing
//!
//! An [`ExposedThing`] fulfills the interactions of a Thing in-process, whatever protocol
//! binding (if any) currently serves it. Protocol servers translate inbound requests into the
//! operations defined here.
//!
//! ```
//! # use serde_json::json;
//! # use wot_servient::{exposed::ExposedThing, thing::{PropertyAffordance, Thing}};
//! # futures::executor::block_on(async {
//! let lamp = ExposedThing::new(Thing::new("Lamp"));
//! lamp.add_property("brightness", PropertyAffordance::default(), json!(50))?;
//!
//! lamp.write_property("brightness", json!(80)).await?;
//! assert_eq!(lamp.read_property("brightness").await?, json!(80));
//! # Ok::<(), wot_servient::Error>(())
//! # }).unwrap();
//! ```

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    error::{aggregate, Error, InteractionKind, Result},
    interaction::{
        action_handler, read_handler, write_handler, ActionState, EventState, ExposedAction,
        ExposedEvent, ExposedProperty, HandlerContext, HandlerResult, Listener, Notifier,
        PropertyState, Scope, Subscription,
    },
    protocol,
    servient::WeakServient,
    thing::{ActionAffordance, EventAffordance, Form, PropertyAffordance, Thing},
};

/// Lifecycle of an [`ExposedThing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Declared, no handler attached yet
    Created,
    /// At least one handler attached
    Configured,
    /// Reachable through the started servers
    Exposed,
    /// Terminal, every interaction is rejected
    Destroyed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Exposed => "exposed",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Interactions {
    // The description without its interaction maps
    base: Thing,
    properties: HashMap<String, ExposedProperty>,
    actions: HashMap<String, ExposedAction>,
    events: HashMap<String, ExposedEvent>,
}

/// Server-side realization of a Thing
pub struct ExposedThing {
    id: Arc<str>,
    title: String,
    interactions: RwLock<Interactions>,
    lifecycle: RwLock<Lifecycle>,
    description_notifier: Notifier,
    servient: Option<WeakServient>,
}

fn initial_value(affordance: &PropertyAffordance) -> Value {
    let schema = &affordance.data_schema;
    schema
        .constant
        .as_ref()
        .or(schema.default.as_ref())
        .cloned()
        .unwrap_or(Value::Null)
}

impl ExposedThing {
    /// Declare every interaction of `td`.
    ///
    /// A description without `id` gets a random `urn:uuid` one. Properties start from their
    /// `const` or `default` value, `null` otherwise.
    pub fn new(td: Thing) -> Self {
        Self::build(td, None)
    }

    pub(crate) fn with_servient(td: Thing, servient: WeakServient) -> Self {
        Self::build(td, Some(servient))
    }

    fn build(mut td: Thing, servient: Option<WeakServient>) -> Self {
        let id: Arc<str> = Arc::from(td.ensure_id());
        td.created.get_or_insert_with(OffsetDateTime::now_utc);

        let properties = td
            .properties
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|(name, affordance)| {
                let state = Arc::new(PropertyState::new(initial_value(&affordance)));
                (name, ExposedProperty { affordance, state })
            })
            .collect();
        let actions = td
            .actions
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|(name, affordance)| (name, ExposedAction::new(affordance)))
            .collect();
        let events = td
            .events
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|(name, affordance)| (name, ExposedEvent::new(affordance)))
            .collect();

        Self {
            id,
            title: td.title.clone(),
            interactions: RwLock::new(Interactions {
                base: td,
                properties,
                actions,
                events,
            }),
            lifecycle: RwLock::new(Lifecycle::Created),
            description_notifier: Notifier::new(),
            servient,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// The current description, reflecting runtime declarations and `readOnly` changes.
    pub fn description(&self) -> Thing {
        let interactions = self.interactions.read();
        let mut td = interactions.base.clone();

        if !interactions.properties.is_empty() {
            td.properties = Some(
                interactions
                    .properties
                    .iter()
                    .map(|(name, p)| (name.clone(), p.affordance.clone()))
                    .collect(),
            );
        }
        if !interactions.actions.is_empty() {
            td.actions = Some(
                interactions
                    .actions
                    .iter()
                    .map(|(name, a)| (name.clone(), a.affordance.clone()))
                    .collect(),
            );
        }
        if !interactions.events.is_empty() {
            td.events = Some(
                interactions
                    .events
                    .iter()
                    .map(|(name, e)| (name.clone(), e.affordance.clone()))
                    .collect(),
            );
        }

        td
    }

    /// Be notified with the serialized description every time the Thing is exposed.
    pub fn observe_description(&self, listener: Listener) -> Subscription {
        self.description_notifier.subscribe(listener)
    }

    pub fn property(&self, name: &str) -> Result<PropertyAffordance> {
        self.interactions
            .read()
            .properties
            .get(name)
            .map(|p| p.affordance.clone())
            .ok_or_else(|| self.not_found(InteractionKind::Property, name))
    }

    pub fn action(&self, name: &str) -> Result<ActionAffordance> {
        self.interactions
            .read()
            .actions
            .get(name)
            .map(|a| a.affordance.clone())
            .ok_or_else(|| self.not_found(InteractionKind::Action, name))
    }

    pub fn event(&self, name: &str) -> Result<EventAffordance> {
        self.interactions
            .read()
            .events
            .get(name)
            .map(|e| e.affordance.clone())
            .ok_or_else(|| self.not_found(InteractionKind::Event, name))
    }

    /// Whether remote peers may write the property.
    pub fn is_writable(&self, name: &str) -> Result<bool> {
        self.property(name)
            .map(|affordance| !affordance.data_schema.read_only)
    }

    /// Whether remote peers may read the property.
    pub fn is_readable(&self, name: &str) -> Result<bool> {
        self.property(name)
            .map(|affordance| !affordance.data_schema.write_only)
    }

    /// Declare a property.
    ///
    /// Re-declaring an existing name replaces its affordance and drops its handlers, the stored
    /// value and the observers are kept and `initial` is ignored.
    pub fn add_property(
        &self,
        name: impl Into<String>,
        affordance: PropertyAffordance,
        initial: Value,
    ) -> Result<()> {
        self.ensure_alive()?;
        let name = name.into();
        let mut interactions = self.interactions.write();
        match interactions.properties.get_mut(&name) {
            Some(property) => {
                debug!(thing = %self.title, property = %name, "redeclaring property");
                property.affordance = affordance;
                property.state.set_read_handler(None);
                property.state.set_write_handler(None);
            }
            None => {
                debug!(thing = %self.title, property = %name, "declaring property");
                let state = Arc::new(PropertyState::new(initial));
                interactions
                    .properties
                    .insert(name, ExposedProperty { affordance, state });
            }
        }

        Ok(())
    }

    /// Declare an action, re-declaring drops the previous handler.
    pub fn add_action(&self, name: impl Into<String>, affordance: ActionAffordance) -> Result<()> {
        self.ensure_alive()?;
        let name = name.into();
        let mut interactions = self.interactions.write();
        match interactions.actions.get_mut(&name) {
            Some(action) => {
                action.affordance = affordance;
                action.state.set_handler(None);
            }
            None => {
                interactions
                    .actions
                    .insert(name, ExposedAction::new(affordance));
            }
        }

        Ok(())
    }

    /// Declare an event, re-declaring keeps the subscribers.
    pub fn add_event(&self, name: impl Into<String>, affordance: EventAffordance) -> Result<()> {
        self.ensure_alive()?;
        let name = name.into();
        let mut interactions = self.interactions.write();
        match interactions.events.get_mut(&name) {
            Some(event) => event.affordance = affordance,
            None => {
                interactions
                    .events
                    .insert(name, ExposedEvent::new(affordance));
            }
        }

        Ok(())
    }

    /// Remove a property, cancelling its observers.
    pub fn remove_property(&self, name: &str) -> Result<()> {
        let property = self
            .interactions
            .write()
            .properties
            .remove(name)
            .ok_or_else(|| self.not_found(InteractionKind::Property, name))?;
        property.state.notifier().clear();

        Ok(())
    }

    pub fn remove_action(&self, name: &str) -> Result<()> {
        self.interactions
            .write()
            .actions
            .remove(name)
            .map(drop)
            .ok_or_else(|| self.not_found(InteractionKind::Action, name))
    }

    /// Remove an event, cancelling its subscribers.
    pub fn remove_event(&self, name: &str) -> Result<()> {
        let event = self
            .interactions
            .write()
            .events
            .remove(name)
            .ok_or_else(|| self.not_found(InteractionKind::Event, name))?;
        event.state.notifier().clear();

        Ok(())
    }

    /// Append a form to an interaction, used by servers when they expose the Thing.
    ///
    /// The prefixes of the protocol terms used by the form are declared in the `@context`.
    pub fn add_form(&self, kind: InteractionKind, name: &str, form: Form) -> Result<()> {
        let prefixes = protocol::context_entries(&form);
        let mut interactions = self.interactions.write();
        let forms = match kind {
            InteractionKind::Property => interactions
                .properties
                .get_mut(name)
                .map(|p| &mut p.affordance.interaction.forms),
            InteractionKind::Action => interactions
                .actions
                .get_mut(name)
                .map(|a| &mut a.affordance.interaction.forms),
            InteractionKind::Event => interactions
                .events
                .get_mut(name)
                .map(|e| &mut e.affordance.interaction.forms),
        };

        let Some(forms) = forms else {
            return Err(self.not_found(kind, name));
        };
        forms.push(form);
        for (prefix, iri) in prefixes {
            interactions.base.add_context_prefix(prefix, iri);
        }

        Ok(())
    }

    /// Append a Thing-level form, e.g. for `readallproperties`.
    pub fn add_thing_form(&self, form: Form) {
        let prefixes = protocol::context_entries(&form);
        let mut interactions = self.interactions.write();
        interactions
            .base
            .forms
            .get_or_insert_with(Vec::new)
            .push(form);
        for (prefix, iri) in prefixes {
            interactions.base.add_context_prefix(prefix, iri);
        }
    }

    /// Names of the declared interactions of a kind.
    pub fn names(&self, kind: InteractionKind) -> Vec<String> {
        let interactions = self.interactions.read();
        match kind {
            InteractionKind::Property => interactions.properties.keys().cloned().collect(),
            InteractionKind::Action => interactions.actions.keys().cloned().collect(),
            InteractionKind::Event => interactions.events.keys().cloned().collect(),
        }
    }

    pub fn set_property_read_handler<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        self.ensure_alive()?;
        self.property_state(name)?
            .set_read_handler(Some(read_handler(handler)));
        debug!(thing = %self.title, property = name, "read handler set");
        self.configured();

        Ok(())
    }

    /// Attach a write handler.
    ///
    /// Registering a write path authorizes writes: a `readOnly` property becomes writable.
    pub fn set_property_write_handler<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Option<Value>>> + Send + 'static,
    {
        self.ensure_alive()?;
        {
            let mut interactions = self.interactions.write();
            let property = interactions
                .properties
                .get_mut(name)
                .ok_or_else(|| self.not_found(InteractionKind::Property, name))?;

            if property.affordance.data_schema.read_only {
                warn!(
                    thing = %self.title,
                    property = name,
                    "write handler set on readOnly property, property is now writable"
                );
                property.affordance.data_schema.read_only = false;
            }
            property
                .state
                .set_write_handler(Some(write_handler(handler)));
        }
        debug!(thing = %self.title, property = name, "write handler set");
        self.configured();

        Ok(())
    }

    pub fn set_action_handler<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Option<Value>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        self.ensure_alive()?;
        self.action_state(name)?
            .set_handler(Some(action_handler(handler)));
        debug!(thing = %self.title, action = name, "action handler set");
        self.configured();

        Ok(())
    }

    /// Read a property, through its read handler when there is one.
    ///
    /// A value produced by the read handler is also stored, notifying observers if it changed.
    pub async fn read_property(&self, name: &str) -> Result<Value> {
        self.ensure_alive()?;
        let state = self.property_state(name)?;

        match state.read_handler() {
            Some(handler) => {
                debug!(thing = %self.title, property = name, "calling read handler");
                let ctx = self.context(name, state.scope());
                let value = handler(ctx).await.map_err(|source| Error::Handler {
                    name: name.to_string(),
                    source,
                })?;
                state.commit(value.clone()).await;
                Ok(value)
            }
            None => Ok(state.value()),
        }
    }

    /// Read every declared property concurrently.
    pub async fn read_all_properties(&self) -> Result<HashMap<String, Value>> {
        let names = self.names(InteractionKind::Property);
        self.read_multiple_properties(names).await
    }

    /// Read the given properties concurrently, failing with [`Error::Aggregate`] if any read
    /// fails.
    pub async fn read_multiple_properties<I, S>(&self, names: I) -> Result<HashMap<String, Value>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_alive()?;
        let reads = names.into_iter().map(|name| {
            let name: String = name.into();
            async move {
                let result = self.read_property(&name).await;
                (name, result)
            }
        });

        let values = aggregate(join_all(reads).await)?;
        Ok(values.into_iter().collect())
    }

    /// Write a property, through its write handler when there is one.
    ///
    /// Observers are notified if the stored value changes. On handler failure the stored value
    /// is left untouched.
    pub async fn write_property(&self, name: &str, value: Value) -> Result<()> {
        self.ensure_alive()?;
        let state = self.property_state(name)?;

        let value = match state.write_handler() {
            Some(handler) => {
                debug!(thing = %self.title, property = name, "calling write handler");
                let ctx = self.context(name, state.scope());
                handler(value.clone(), ctx)
                    .await
                    .map_err(|source| Error::Handler {
                        name: name.to_string(),
                        source,
                    })?
                    .unwrap_or(value)
            }
            None => {
                debug!(thing = %self.title, property = name, "storing value directly");
                value
            }
        };

        state.commit(value).await;
        Ok(())
    }

    /// Write the given properties concurrently, failing with [`Error::Aggregate`] if any write
    /// fails. Successful writes are kept.
    pub async fn write_multiple_properties<I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.ensure_alive()?;
        let writes = values.into_iter().map(|(name, value)| async move {
            let result = self.write_property(&name, value).await;
            (name, result)
        });

        aggregate(join_all(writes).await).map(drop)
    }

    pub async fn invoke_action(&self, name: &str, input: Option<Value>) -> Result<Value> {
        self.ensure_alive()?;
        let state = self.action_state(name)?;
        let handler = state.handler().ok_or_else(|| Error::NoHandler {
            thing: self.title.clone(),
            action: name.to_string(),
        })?;

        debug!(thing = %self.title, action = name, "invoking action");
        handler(input, self.context(name, state.scope()))
            .await
            .map_err(|source| Error::Handler {
                name: name.to_string(),
                source,
            })
    }

    /// Be notified of every change of the property value.
    pub fn observe_property(&self, name: &str, listener: Listener) -> Result<Subscription> {
        self.ensure_alive()?;
        Ok(self.property_state(name)?.notifier().subscribe(listener))
    }

    /// Cancel an observation. Cancelling twice is a no-op.
    ///
    /// An active subscription obtained from another interaction is rejected with
    /// [`Error::NotFound`] and left untouched.
    pub fn unobserve_property(&self, name: &str, subscription: &Subscription) -> Result<()> {
        let state = self.property_state(name)?;
        self.cancel(state.notifier(), InteractionKind::Property, name, subscription)
    }

    pub fn subscribe_event(&self, name: &str, listener: Listener) -> Result<Subscription> {
        self.ensure_alive()?;
        Ok(self.event_state(name)?.notifier().subscribe(listener))
    }

    /// Cancel an event subscription. Cancelling twice is a no-op.
    pub fn unsubscribe_event(&self, name: &str, subscription: &Subscription) -> Result<()> {
        let state = self.event_state(name)?;
        self.cancel(state.notifier(), InteractionKind::Event, name, subscription)
    }

    /// Deliver `data` to every subscriber of the event, returning how many were reached.
    ///
    /// Only events can be emitted, property observers are driven by value changes.
    pub fn emit_event(&self, name: &str, data: Value) -> Result<usize> {
        self.ensure_alive()?;
        let delivered = self.event_state(name)?.emit(&data);
        debug!(thing = %self.title, event = name, delivered, "event emitted");

        Ok(delivered)
    }

    /// Make the Thing reachable through the servers of its servient.
    ///
    /// Description observers receive the current description.
    ///
    /// When some servers fail to serve the Thing the others keep serving it: the Thing is
    /// exposed and the failures are returned as [`Error::Aggregate`].
    pub async fn expose(self: &Arc<Self>) -> Result<()> {
        self.ensure_alive()?;
        let routed = match self.servient.as_ref().and_then(WeakServient::upgrade) {
            Some(servient) => servient.expose(self).await,
            None => Ok(()),
        };
        if matches!(routed, Err(ref err) if err.failures().is_none()) {
            return routed;
        }

        self.interactions.write().base.modified = Some(OffsetDateTime::now_utc());
        *self.lifecycle.write() = Lifecycle::Exposed;
        match &routed {
            Ok(()) => info!(thing = %self.title, id = %self.id, "thing exposed"),
            Err(err) => warn!(thing = %self.title, id = %self.id, %err, "thing partially exposed"),
        }

        let description = serde_json::to_value(self.description())?;
        self.description_notifier.notify(&description);

        routed
    }

    /// End the live phase of the Thing.
    ///
    /// The Thing is withdrawn from its servient and every observer is cancelled. Destroying an
    /// already destroyed Thing is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        if self.lifecycle() == Lifecycle::Destroyed {
            return Ok(());
        }

        if let Some(servient) = self.servient.as_ref().and_then(WeakServient::upgrade) {
            if servient.destroy_thing(&self.id).await? {
                return Ok(());
            }
        }

        self.teardown();
        Ok(())
    }

    pub(crate) fn teardown(&self) {
        *self.lifecycle.write() = Lifecycle::Destroyed;

        let interactions = self.interactions.read();
        for property in interactions.properties.values() {
            property.state.notifier().clear();
        }
        for event in interactions.events.values() {
            event.state.notifier().clear();
        }
        self.description_notifier.clear();
        info!(thing = %self.title, id = %self.id, "thing destroyed");
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Destroyed => Err(Error::Lifecycle {
                target: format!("Thing \"{}\"", self.title),
                state: Lifecycle::Destroyed.as_str(),
            }),
            _ => Ok(()),
        }
    }

    fn configured(&self) {
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == Lifecycle::Created {
            *lifecycle = Lifecycle::Configured;
        }
    }

    fn cancel(
        &self,
        notifier: &Notifier,
        kind: InteractionKind,
        name: &str,
        subscription: &Subscription,
    ) -> Result<()> {
        if subscription.is_active() && !notifier.contains(subscription.id()) {
            return Err(self.not_found(kind, name));
        }

        subscription.unsubscribe();
        Ok(())
    }

    fn context(&self, name: &str, scope: &Scope) -> HandlerContext {
        HandlerContext {
            thing_id: Arc::clone(&self.id),
            name: Arc::from(name),
            scope: scope.clone(),
        }
    }

    fn not_found(&self, kind: InteractionKind, name: &str) -> Error {
        Error::NotFound {
            thing: self.title.clone(),
            kind,
            name: name.to_string(),
        }
    }

    fn property_state(&self, name: &str) -> Result<Arc<PropertyState>> {
        self.interactions
            .read()
            .properties
            .get(name)
            .map(|p| Arc::clone(&p.state))
            .ok_or_else(|| self.not_found(InteractionKind::Property, name))
    }

    fn action_state(&self, name: &str) -> Result<Arc<ActionState>> {
        self.interactions
            .read()
            .actions
            .get(name)
            .map(|a| Arc::clone(&a.state))
            .ok_or_else(|| self.not_found(InteractionKind::Action, name))
    }

    fn event_state(&self, name: &str) -> Result<Arc<EventState>> {
        self.interactions
            .read()
            .events
            .get(name)
            .map(|e| Arc::clone(&e.state))
            .ok_or_else(|| self.not_found(InteractionKind::Event, name))
    }
}

impl fmt::Debug for ExposedThing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExposedThing")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}
