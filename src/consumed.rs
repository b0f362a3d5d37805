//! Consumed Thing
//!
//! A [`ConsumedThing`] performs the interactions of a remote Thing. Every operation picks the
//! first form of the affordance that supports it and whose scheme has a client factory in the
//! servient, then exchanges [`Content`] with the protocol client.

use std::{collections::HashMap, fmt, sync::Arc};

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    binding::{ContentListener, ProtocolClient},
    content::Content,
    error::{aggregate, Error, InteractionKind, Result},
    interaction::{Listener, Subscription},
    servient::Servient,
    thing::{DataSchema, Form, FormOperation, Thing},
};

/// Client-side proxy of a remote Thing
pub struct ConsumedThing {
    servient: Servient,
    td: Thing,
    // One client per scheme, secured on creation
    clients: Mutex<HashMap<String, Arc<dyn ProtocolClient>>>,
}

impl ConsumedThing {
    pub fn new(servient: Servient, td: Thing) -> Self {
        Self {
            servient,
            td,
            clients: Default::default(),
        }
    }

    #[inline]
    pub fn description(&self) -> &Thing {
        &self.td
    }

    #[inline]
    pub fn id(&self) -> Option<&str> {
        self.td.id.as_deref()
    }

    #[inline]
    pub fn title(&self) -> &str {
        &self.td.title
    }

    fn client(&self, scheme: &str) -> Result<Arc<dyn ProtocolClient>> {
        if let Some(client) = self.clients.lock().get(scheme) {
            return Ok(Arc::clone(client));
        }

        let client = self.servient.get_client_for(scheme)?;
        let credentials = self
            .id()
            .and_then(|id| self.servient.credentials_for(id));
        if !client.set_security(&self.td.security_schemes(), credentials.as_ref()) {
            warn!(
                thing = %self.td.title,
                %scheme,
                "security requirements not satisfied, requests may be rejected"
            );
        }

        let client = Arc::clone(
            self.clients
                .lock()
                .entry(scheme.to_string())
                .or_insert(client),
        );
        Ok(client)
    }

    /// Pick the form and the client serving `op`.
    ///
    /// The returned form carries the absolute href.
    fn select(
        &self,
        forms: &[Form],
        kind: InteractionKind,
        name: &str,
        op: FormOperation,
    ) -> Result<(Form, Arc<dyn ProtocolClient>)> {
        let mut unsupported = None;
        for form in forms.iter().filter(|form| form.supports(kind, op)) {
            let url = form.resolve(self.td.base.as_deref())?;
            if !self.servient.has_client_for(url.scheme()) {
                unsupported.get_or_insert_with(|| url.scheme().to_string());
                continue;
            }

            let client = self.client(url.scheme())?;
            let mut form = form.clone();
            form.href = url.into();
            debug!(thing = %self.td.title, %kind, name, %op, href = %form.href, "form selected");
            return Ok((form, client));
        }

        Err(match unsupported {
            Some(scheme) => Error::UnsupportedScheme(scheme),
            None => Error::NoForm {
                kind,
                name: name.to_string(),
                op,
            },
        })
    }

    fn not_found(&self, kind: InteractionKind, name: &str) -> Error {
        Error::NotFound {
            thing: self.td.title.clone(),
            kind,
            name: name.to_string(),
        }
    }

    fn decode(&self, content: &Content, schema: Option<&DataSchema>) -> Result<Value> {
        self.servient.codecs().content_to_value(content, schema)
    }

    pub async fn read_property(&self, name: &str) -> Result<Value> {
        let property = self
            .td
            .property(name)
            .ok_or_else(|| self.not_found(InteractionKind::Property, name))?;
        let (form, client) = self.select(
            &property.interaction.forms,
            InteractionKind::Property,
            name,
            FormOperation::ReadProperty,
        )?;

        let content = client.read_resource(&form).await?;
        self.decode(&content, Some(&property.data_schema))
    }

    /// Read every property of the description concurrently.
    pub async fn read_all_properties(&self) -> Result<HashMap<String, Value>> {
        let names: Vec<_> = self
            .td
            .properties
            .iter()
            .flat_map(|properties| properties.keys().cloned())
            .collect();
        self.read_multiple_properties(names).await
    }

    /// Read the given properties concurrently, failing with [`Error::Aggregate`] if any read
    /// fails.
    pub async fn read_multiple_properties<I, S>(&self, names: I) -> Result<HashMap<String, Value>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
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

    pub async fn write_property(&self, name: &str, value: Value) -> Result<()> {
        let property = self
            .td
            .property(name)
            .ok_or_else(|| self.not_found(InteractionKind::Property, name))?;
        let (form, client) = self.select(
            &property.interaction.forms,
            InteractionKind::Property,
            name,
            FormOperation::WriteProperty,
        )?;

        let content = self.servient.codecs().value_to_content(
            &value,
            Some(&property.data_schema),
            Some(form.content_type_or_default()),
        )?;
        client.write_resource(&form, content).await
    }

    /// Write the given properties concurrently, failing with [`Error::Aggregate`] if any write
    /// fails.
    pub async fn write_multiple_properties<I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let writes = values.into_iter().map(|(name, value)| async move {
            let result = self.write_property(&name, value).await;
            (name, result)
        });

        aggregate(join_all(writes).await).map(drop)
    }

    pub async fn invoke_action(&self, name: &str, input: Option<Value>) -> Result<Value> {
        let action = self
            .td
            .action(name)
            .ok_or_else(|| self.not_found(InteractionKind::Action, name))?;
        let (form, client) = self.select(
            &action.interaction.forms,
            InteractionKind::Action,
            name,
            FormOperation::InvokeAction,
        )?;

        let content = input
            .map(|input| {
                self.servient.codecs().value_to_content(
                    &input,
                    action.input.as_ref(),
                    Some(form.content_type_or_default()),
                )
            })
            .transpose()?;
        let output = client.invoke_resource(&form, content).await?;
        self.decode(&output, action.output.as_ref())
    }

    /// Be notified of every change of a remote property.
    ///
    /// Notifications that cannot be decoded are dropped.
    pub async fn observe_property(&self, name: &str, listener: Listener) -> Result<Subscription> {
        let property = self
            .td
            .property(name)
            .ok_or_else(|| self.not_found(InteractionKind::Property, name))?;
        let (form, client) = self.select(
            &property.interaction.forms,
            InteractionKind::Property,
            name,
            FormOperation::ObserveProperty,
        )?;

        let on_update = self.decoding_listener(property.data_schema.clone(), listener);
        client.subscribe_resource(&form, on_update).await
    }

    /// Be notified of every occurrence of a remote event.
    pub async fn subscribe_event(&self, name: &str, listener: Listener) -> Result<Subscription> {
        let event = self
            .td
            .event(name)
            .ok_or_else(|| self.not_found(InteractionKind::Event, name))?;
        let (form, client) = self.select(
            &event.interaction.forms,
            InteractionKind::Event,
            name,
            FormOperation::SubscribeEvent,
        )?;

        let on_update = self.decoding_listener(event.data.clone().unwrap_or_default(), listener);
        client.subscribe_resource(&form, on_update).await
    }

    fn decoding_listener(&self, schema: DataSchema, listener: Listener) -> ContentListener {
        let codecs = Arc::clone(self.servient.codecs());
        let title = self.td.title.clone();

        Arc::new(move |content: Content| {
            match codecs.content_to_value(&content, Some(&schema)) {
                Ok(value) => listener(&value),
                Err(err) => warn!(thing = %title, %err, "dropping notification"),
            }
        })
    }
}

impl fmt::Debug for ConsumedThing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumedThing")
            .field("id", &self.td.id)
            .field("title", &self.td.title)
            .field("schemes", &self.clients.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}
