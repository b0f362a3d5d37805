//! Thing Description data structures
//!
//! A Thing Description, or `TD`, stores the semantic metadata and the interface descriptions of
//! a physical or virtual entity, called `Thing`.
//!
//! The servient treats the description as input: it is parsed with [serde_json], handed to an
//! [`ExposedThing`](crate::exposed::ExposedThing) or a
//! [`ConsumedThing`](crate::consumed::ConsumedThing). The runtime only updates the `readOnly`
//! flags, the timestamps and the forms that servers add when they expose a Thing.
//!
//! Protocol specific fields of a [`Form`] are kept verbatim in [`Form::other`] and can be
//! decoded with [`Form::extension`].

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use serde_with::{serde_as, skip_serializing_none, DeserializeAs, OneOrMany, Same};
use time::OffsetDateTime;
use url::Url;

use crate::{
    error::{Error, InteractionKind, Result},
    protocol::FormExtension,
};

pub const TD_CONTEXT_10: &str = "https://www.w3.org/2019/wot/td/v1";
pub const TD_CONTEXT_11: &str = "https://www.w3.org/2019/wot/td/v1.1";

/// Content type used when a form does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// An abstraction of a physical or a virtual entity
///
/// It contains metadata and a description of its interfaces.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thing {
    /// A [JSON-LD @context](https://www.w3.org/TR/json-ld11/#the-context)
    #[serde(rename = "@context", default = "default_context")]
    pub context: Value,

    /// A unique identifier
    pub id: Option<String>,

    /// JSON-LD semantic keywords
    #[serde(rename = "@type", default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub attype: Option<Vec<String>>,

    /// Human-readable title to be displayed
    pub title: String,

    /// Human-readable additional information
    pub description: Option<String>,

    /// Version information
    pub version: Option<VersionInfo>,

    /// Time of creation of this description
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created: Option<OffsetDateTime>,

    /// Time of last update of this description
    ///
    /// The servient refreshes it every time the Thing is exposed.
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub modified: Option<OffsetDateTime>,

    /// URI to the device maintainer
    pub support: Option<String>,

    /// Base URI to be used to resolve all the other relative URIs
    pub base: Option<String>,

    /// Property-based interaction affordances
    pub properties: Option<HashMap<String, PropertyAffordance>>,

    /// Action-based interaction affordances
    pub actions: Option<HashMap<String, ActionAffordance>>,

    /// Event-based interaction affordances
    pub events: Option<HashMap<String, EventAffordance>>,

    /// Arbitrary resources that relate to the current Thing
    pub links: Option<Vec<Link>>,

    /// Bulk-operations over the Thing properties
    pub forms: Option<Vec<Form>>,

    /// Thing-wide Security constraints
    ///
    /// Names of the [Thing::security_definitions] that must be all satisfied.
    #[serde(default)]
    #[serde_as(as = "OneOrMany<_>")]
    pub security: Vec<String>,

    /// Security definitions, by name
    #[serde(default)]
    pub security_definitions: HashMap<String, SecurityScheme>,

    /// Any other top-level term, kept as is
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

fn default_context() -> Value {
    TD_CONTEXT_11.into()
}

impl Thing {
    /// Create an empty description with the default `@context` and `nosec` security.
    pub fn new(title: impl Into<String>) -> Self {
        let mut security_definitions = HashMap::new();
        security_definitions.insert("nosec_sc".to_string(), SecurityScheme::nosec());

        Self {
            context: default_context(),
            title: title.into(),
            security: vec!["nosec_sc".to_string()],
            security_definitions,
            ..Default::default()
        }
    }

    #[inline]
    pub fn property(&self, name: &str) -> Option<&PropertyAffordance> {
        self.properties.as_ref()?.get(name)
    }

    #[inline]
    pub fn action(&self, name: &str) -> Option<&ActionAffordance> {
        self.actions.as_ref()?.get(name)
    }

    #[inline]
    pub fn event(&self, name: &str) -> Option<&EventAffordance> {
        self.events.as_ref()?.get(name)
    }

    /// Iterate over all the forms of the description, Thing-level ones included.
    pub fn all_forms(&self) -> impl Iterator<Item = &Form> {
        let properties = self
            .properties
            .iter()
            .flat_map(|map| map.values())
            .flat_map(|p| &p.interaction.forms);
        let actions = self
            .actions
            .iter()
            .flat_map(|map| map.values())
            .flat_map(|a| &a.interaction.forms);
        let events = self
            .events
            .iter()
            .flat_map(|map| map.values())
            .flat_map(|e| &e.interaction.forms);

        self.forms
            .iter()
            .flatten()
            .chain(properties)
            .chain(actions)
            .chain(events)
    }

    /// The lower-cased URI schemes used by the forms of the description.
    ///
    /// Relative hrefs take the scheme of [Thing::base], if any.
    pub fn schemes(&self) -> BTreeSet<String> {
        let base_scheme = self.base.as_deref().and_then(uri_scheme);

        self.all_forms()
            .filter_map(|form| form.scheme().or(base_scheme))
            .map(str::to_ascii_lowercase)
            .collect()
    }

    /// Declare a compact IRI prefix in the `@context`, keeping an existing declaration.
    pub fn add_context_prefix(&mut self, prefix: &str, iri: &str) {
        let mut entry = Map::new();
        entry.insert(prefix.to_string(), Value::String(iri.to_string()));

        match &mut self.context {
            Value::Array(items) => match items.iter().position(Value::is_object) {
                Some(pos) => {
                    if let Value::Object(map) = &mut items[pos] {
                        map.entry(prefix)
                            .or_insert_with(|| Value::String(iri.to_string()));
                    }
                }
                None => items.push(Value::Object(entry)),
            },
            context => {
                let base = std::mem::take(context);
                *context = Value::Array(vec![base, Value::Object(entry)]);
            }
        }
    }

    /// Assign a random `urn:uuid` id when the description does not have one.
    ///
    /// Returns the (possibly new) id.
    pub fn ensure_id(&mut self) -> &str {
        self.id
            .get_or_insert_with(|| format!("urn:uuid:{}", uuid::Uuid::new_v4()))
    }

    /// The security schemes referenced by [Thing::security].
    pub fn security_schemes(&self) -> Vec<SecurityScheme> {
        self.security
            .iter()
            .filter_map(|name| self.security_definitions.get(name))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct VersionInfo {
    pub instance: String,

    pub model: Option<String>,
}

impl<S> From<S> for VersionInfo
where
    S: Into<String>,
{
    fn from(instance: S) -> Self {
        Self {
            instance: instance.into(),
            model: None,
        }
    }
}

/// Fields shared by properties, actions and events
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionAffordance {
    #[serde(rename = "@type", default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub attype: Option<Vec<String>>,

    pub title: Option<String>,

    pub description: Option<String>,

    #[serde(default)]
    pub forms: Vec<Form>,

    pub uri_variables: Option<HashMap<String, DataSchema>>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PropertyAffordance {
    #[serde(flatten)]
    pub interaction: InteractionAffordance,

    #[serde(flatten)]
    pub data_schema: DataSchema,

    pub observable: Option<bool>,
}

impl PropertyAffordance {
    #[inline]
    pub fn is_observable(&self) -> bool {
        self.observable.unwrap_or(false)
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ActionAffordance {
    #[serde(flatten)]
    pub interaction: InteractionAffordance,

    pub input: Option<DataSchema>,

    pub output: Option<DataSchema>,

    #[serde(default)]
    pub safe: bool,

    #[serde(default)]
    pub idempotent: bool,

    pub synchronous: Option<bool>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAffordance {
    #[serde(flatten)]
    pub interaction: InteractionAffordance,

    pub subscription: Option<DataSchema>,

    pub data: Option<DataSchema>,

    pub cancellation: Option<DataSchema>,
}

#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    #[serde(rename = "@type", default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub attype: Option<Vec<String>>,

    pub title: Option<String>,

    pub description: Option<String>,

    #[serde(rename = "const")]
    pub constant: Option<Value>,

    pub default: Option<Value>,

    pub unit: Option<String>,

    pub one_of: Option<Vec<Self>>,

    #[serde(rename = "enum")]
    pub enumeration: Option<Vec<Value>>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub write_only: bool,

    pub format: Option<String>,

    #[serde(flatten)]
    pub subtype: Option<DataSchemaSubtype>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataSchemaSubtype {
    Array(ArraySchema),
    Boolean,
    Number(NumberSchema),
    Integer(IntegerSchema),
    Object(ObjectSchema),
    String(StringSchema),
    Null,
}

#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArraySchema {
    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub items: Option<Vec<DataSchema>>,

    pub min_items: Option<u32>,

    pub max_items: Option<u32>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberSchema {
    pub minimum: Option<f64>,

    pub maximum: Option<f64>,

    pub exclusive_minimum: Option<f64>,

    pub exclusive_maximum: Option<f64>,

    pub multiple_of: Option<f64>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegerSchema {
    pub minimum: Option<i64>,

    pub maximum: Option<i64>,

    pub exclusive_minimum: Option<i64>,

    pub exclusive_maximum: Option<i64>,

    pub multiple_of: Option<u64>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ObjectSchema {
    pub properties: Option<HashMap<String, DataSchema>>,

    pub required: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StringSchema {
    pub min_length: Option<u32>,

    pub max_length: Option<u32>,

    pub pattern: Option<String>,

    pub content_encoding: Option<String>,

    pub content_media_type: Option<String>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityScheme {
    /// Security mechanism identifier, such as `nosec`, `basic` or `bearer`
    pub scheme: String,

    pub description: Option<String>,

    /// URI of the proxy server this security configuration provides access to
    pub proxy: Option<String>,

    /// Scheme specific fields (`in`, `name`, `authorization`, `flow`, ...)
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl SecurityScheme {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            description: None,
            proxy: None,
            other: Map::new(),
        }
    }

    #[inline]
    pub fn nosec() -> Self {
        Self::new("nosec")
    }

    #[inline]
    pub fn is_nosec(&self) -> bool {
        self.scheme == "nosec"
    }
}

impl Default for SecurityScheme {
    fn default() -> Self {
        Self::nosec()
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Link {
    pub href: String,

    #[serde(rename = "type")]
    pub ty: Option<String>,

    pub rel: Option<String>,

    pub anchor: Option<String>,
}

/// Binding of an interaction to a transport
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    #[serde(default, skip_serializing_if = "DefaultedFormOperations::is_default")]
    pub op: DefaultedFormOperations,

    pub href: String,

    pub content_type: Option<String>,

    pub content_coding: Option<String>,

    pub subprotocol: Option<String>,

    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub security: Option<Vec<String>>,

    #[serde(default)]
    #[serde_as(as = "Option<OneOrMany<_>>")]
    pub scopes: Option<Vec<String>>,

    pub response: Option<ExpectedResponse>,

    /// Protocol specific terms, such as `mqv:qos` or `htv:methodName`
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Form {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            ..Default::default()
        }
    }

    /// Builder-style helper to restrict the operations of the form.
    pub fn with_ops(mut self, ops: impl IntoIterator<Item = FormOperation>) -> Self {
        self.op = DefaultedFormOperations::Custom(ops.into_iter().collect());
        self
    }

    /// Builder-style helper to set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The URI scheme of an absolute href, `None` for relative hrefs.
    #[inline]
    pub fn scheme(&self) -> Option<&str> {
        uri_scheme(&self.href)
    }

    /// Resolve the href against the Thing base URI.
    pub fn resolve(&self, base: Option<&str>) -> Result<Url> {
        let invalid = |source| Error::InvalidHref {
            href: self.href.clone(),
            source,
        };

        match (self.scheme(), base) {
            (Some(_), _) | (None, None) => Url::parse(&self.href).map_err(invalid),
            (None, Some(base)) => Url::parse(base)
                .and_then(|base| base.join(&self.href))
                .map_err(invalid),
        }
    }

    #[inline]
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Whether the form can be used for `op` on an interaction of the given kind.
    #[inline]
    pub fn supports(&self, kind: InteractionKind, op: FormOperation) -> bool {
        self.op.contains(kind, op)
    }

    /// Decode the protocol specific terms of the form.
    pub fn extension<T>(&self) -> Result<T, serde_json::Error>
    where
        T: FormExtension,
    {
        serde_json::from_value(Value::Object(self.other.clone()))
    }
}

fn uri_scheme(href: &str) -> Option<&str> {
    let (scheme, _) = href.split_once(':')?;
    let mut chars = scheme.chars();
    let valid = chars.next()?.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));

    valid.then_some(scheme)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormOperation {
    ReadProperty,
    WriteProperty,
    ObserveProperty,
    UnobserveProperty,
    InvokeAction,
    QueryAction,
    CancelAction,
    SubscribeEvent,
    UnsubscribeEvent,
    ReadAllProperties,
    WriteAllProperties,
    ReadMultipleProperties,
    WriteMultipleProperties,
    ObserveAllProperties,
    UnobserveAllProperties,
    SubscribeAllEvents,
    UnsubscribeAllEvents,
    QueryAllActions,
}

impl FormOperation {
    /// Operations assumed by a form that does not list any, for the given affordance kind.
    ///
    /// Properties also accept observation, so that a plain form can be used to watch a value.
    pub fn defaults(kind: InteractionKind) -> &'static [FormOperation] {
        match kind {
            InteractionKind::Property => &[
                Self::ReadProperty,
                Self::WriteProperty,
                Self::ObserveProperty,
                Self::UnobserveProperty,
            ],
            InteractionKind::Action => &[Self::InvokeAction],
            InteractionKind::Event => &[Self::SubscribeEvent, Self::UnsubscribeEvent],
        }
    }
}

impl fmt::Display for FormOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadProperty => "readproperty",
            Self::WriteProperty => "writeproperty",
            Self::ObserveProperty => "observeproperty",
            Self::UnobserveProperty => "unobserveproperty",
            Self::InvokeAction => "invokeaction",
            Self::QueryAction => "queryaction",
            Self::CancelAction => "cancelaction",
            Self::SubscribeEvent => "subscribeevent",
            Self::UnsubscribeEvent => "unsubscribeevent",
            Self::ReadAllProperties => "readallproperties",
            Self::WriteAllProperties => "writeallproperties",
            Self::ReadMultipleProperties => "readmultipleproperties",
            Self::WriteMultipleProperties => "writemultipleproperties",
            Self::ObserveAllProperties => "observeallproperties",
            Self::UnobserveAllProperties => "unobserveallproperties",
            Self::SubscribeAllEvents => "subscribeallevents",
            Self::UnsubscribeAllEvents => "unsubscribeallevents",
            Self::QueryAllActions => "queryallactions",
        };

        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DefaultedFormOperations {
    #[default]
    Default,
    Custom(Vec<FormOperation>),
}

impl DefaultedFormOperations {
    #[inline]
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }

    pub fn contains(&self, kind: InteractionKind, op: FormOperation) -> bool {
        match self {
            Self::Default => FormOperation::defaults(kind).contains(&op),
            Self::Custom(ops) => ops.contains(&op),
        }
    }
}

impl Serialize for DefaultedFormOperations {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Default => serializer.serialize_none(),
            Self::Custom(ops) if ops.is_empty() => serializer.serialize_none(),
            Self::Custom(ops) => ops.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DefaultedFormOperations
where
    OneOrMany<Same>: DeserializeAs<'de, Vec<FormOperation>>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ops = Option::<OneOrMany<_>>::deserialize_as(deserializer)?;
        Ok(ops.map(Self::Custom).unwrap_or(Self::Default))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedResponse {
    pub content_type: String,
}
