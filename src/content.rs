//! Content and codecs
//!
//! Every value that crosses a protocol boundary travels as [`Content`]: an opaque payload tagged
//! with its media type. [`ContentSerdes`] maps media types to the [`ContentCodec`] able to turn
//! that payload into a [`Value`] and back.
//!
//! Unknown media types never fail the lookup, they fall back to the default codec
//! (`application/octet-stream` unless configured otherwise).

use std::{collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::{Error, Result},
    thing::{DataSchema, DataSchemaSubtype, DEFAULT_CONTENT_TYPE},
};

pub const JSON: &str = "application/json";
pub const TEXT: &str = "text/plain";
pub const CBOR: &str = "application/cbor";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A payload exchanged with a protocol binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Content {
    pub content_type: String,
    pub body: Bytes,
}

impl Content {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    #[inline]
    pub fn media_type(&self) -> MediaType {
        MediaType::parse(&self.content_type)
    }
}

/// A parsed media type, such as `text/plain; charset=utf-8`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaType {
    essence: String,
    parameters: Vec<(String, String)>,
}

impl MediaType {
    /// Parse a media type leniently, lower-casing the essence and the parameter names.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split(';');
        let essence = parts
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let parameters = parts
            .filter_map(|param| {
                let (name, value) = param.split_once('=')?;
                let value = value.trim().trim_matches('"');
                Some((name.trim().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        Self {
            essence,
            parameters,
        }
    }

    /// The `type/subtype` part.
    #[inline]
    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The structured syntax suffix, `json` for `application/td+json`.
    pub fn suffix(&self) -> Option<&str> {
        self.essence.rsplit_once('+').map(|(_, suffix)| suffix)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (name, value) in &self.parameters {
            write!(f, ";{name}={value}")?;
        }

        Ok(())
    }
}

/// Conversion between raw bytes and values for one media type.
pub trait ContentCodec: Send + Sync {
    /// The media type essence handled by the codec.
    fn media_type(&self) -> &str;

    fn bytes_to_value(
        &self,
        bytes: &[u8],
        schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Value>;

    fn value_to_bytes(
        &self,
        value: &Value,
        schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Bytes>;
}

fn codec_error(media_type: &MediaType, reason: impl fmt::Display) -> Error {
    Error::Codec {
        media_type: media_type.to_string(),
        reason: reason.to_string(),
    }
}

fn is_string_schema(schema: Option<&DataSchema>) -> bool {
    matches!(
        schema.and_then(|s| s.subtype.as_ref()),
        Some(DataSchemaSubtype::String(_))
    )
}

/// `application/json`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ContentCodec for JsonCodec {
    fn media_type(&self) -> &str {
        JSON
    }

    fn bytes_to_value(
        &self,
        bytes: &[u8],
        schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }

        match serde_json::from_slice(bytes) {
            Ok(value) => Ok(value),
            // Some devices send bare strings without quotes
            Err(_) if is_string_schema(schema) => std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_string()))
                .map_err(|err| codec_error(media_type, err)),
            Err(err) => Err(codec_error(media_type, err)),
        }
    }

    fn value_to_bytes(
        &self,
        value: &Value,
        _schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| codec_error(media_type, err))
    }
}

/// `text/plain`, using the schema to recover booleans and numbers
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl ContentCodec for TextCodec {
    fn media_type(&self) -> &str {
        TEXT
    }

    fn bytes_to_value(
        &self,
        bytes: &[u8],
        schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Value> {
        match media_type.parameter("charset") {
            None => {}
            Some(charset)
                if charset.eq_ignore_ascii_case("utf-8")
                    || charset.eq_ignore_ascii_case("us-ascii") => {}
            Some(charset) => {
                return Err(codec_error(
                    media_type,
                    format!("unsupported charset {charset}"),
                ))
            }
        }

        let text = std::str::from_utf8(bytes).map_err(|err| codec_error(media_type, err))?;
        let trimmed = text.trim();
        let value = match schema.and_then(|s| s.subtype.as_ref()) {
            Some(DataSchemaSubtype::Boolean) => match trimmed {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(codec_error(media_type, format!("{trimmed:?} is not a boolean"))),
            },
            Some(DataSchemaSubtype::Integer(_)) => trimmed
                .parse::<i64>()
                .map(Value::from)
                .map_err(|err| codec_error(media_type, err))?,
            Some(DataSchemaSubtype::Number(_)) => trimmed
                .parse::<f64>()
                .map_err(|err| codec_error(media_type, err))
                .and_then(|n| {
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .ok_or_else(|| codec_error(media_type, "not a finite number"))
                })?,
            Some(DataSchemaSubtype::Null) if trimmed.is_empty() => Value::Null,
            _ => Value::String(text.to_string()),
        };

        Ok(value)
    }

    fn value_to_bytes(
        &self,
        value: &Value,
        _schema: Option<&DataSchema>,
        _media_type: &MediaType,
    ) -> Result<Bytes> {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        Ok(Bytes::from(text))
    }
}

/// `application/cbor`
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl ContentCodec for CborCodec {
    fn media_type(&self) -> &str {
        CBOR
    }

    fn bytes_to_value(
        &self,
        bytes: &[u8],
        _schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }

        ciborium::de::from_reader(bytes).map_err(|err| codec_error(media_type, format!("{err:?}")))
    }

    fn value_to_bytes(
        &self,
        value: &Value,
        _schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Bytes> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|err| codec_error(media_type, format!("{err:?}")))?;

        Ok(Bytes::from(buf))
    }
}

/// Opaque bytes
///
/// Payloads that are valid UTF-8 become strings, anything else an array of byte values.
/// Encoding accepts the same two shapes, other values are written as JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct OctetStreamCodec;

impl ContentCodec for OctetStreamCodec {
    fn media_type(&self) -> &str {
        OCTET_STREAM
    }

    fn bytes_to_value(
        &self,
        bytes: &[u8],
        _schema: Option<&DataSchema>,
        _media_type: &MediaType,
    ) -> Result<Value> {
        let value = match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Array(bytes.iter().map(|&b| Value::from(b)).collect()),
        };

        Ok(value)
    }

    fn value_to_bytes(
        &self,
        value: &Value,
        _schema: Option<&DataSchema>,
        media_type: &MediaType,
    ) -> Result<Bytes> {
        match value {
            Value::String(s) => Ok(Bytes::from(s.clone())),
            Value::Null => Ok(Bytes::new()),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| codec_error(media_type, "array items must be bytes"))
                })
                .collect::<Result<Vec<u8>>>()
                .map(Bytes::from),
            other => Ok(Bytes::from(other.to_string())),
        }
    }
}

/// Registry of the codecs available to the protocol bindings
pub struct ContentSerdes {
    codecs: RwLock<HashMap<String, Arc<dyn ContentCodec>>>,
    default_codec: Arc<dyn ContentCodec>,
}

impl ContentSerdes {
    /// A registry with the JSON, text, CBOR and octet-stream codecs.
    pub fn new() -> Self {
        let serdes = Self::with_default(Arc::new(OctetStreamCodec));
        serdes.register(Arc::new(JsonCodec));
        serdes.register(Arc::new(TextCodec));
        serdes.register(Arc::new(CborCodec));
        serdes
    }

    /// An empty registry that always answers with `default_codec`.
    pub fn with_default(default_codec: Arc<dyn ContentCodec>) -> Self {
        let mut codecs: HashMap<String, Arc<dyn ContentCodec>> = HashMap::new();
        codecs.insert(
            MediaType::parse(default_codec.media_type()).essence,
            Arc::clone(&default_codec),
        );

        Self {
            codecs: RwLock::new(codecs),
            default_codec,
        }
    }

    /// Register a codec under its own media type, replacing any previous one.
    pub fn register(&self, codec: Arc<dyn ContentCodec>) {
        let media_type = codec.media_type().to_string();
        self.register_as(&media_type, codec);
    }

    /// Register a codec under an arbitrary media type, replacing any previous one.
    pub fn register_as(&self, media_type: &str, codec: Arc<dyn ContentCodec>) {
        let essence = MediaType::parse(media_type).essence;
        debug!(media_type = %essence, "registering codec");
        self.codecs.write().insert(essence, codec);
    }

    fn lookup(&self, media_type: &MediaType) -> Option<Arc<dyn ContentCodec>> {
        let codecs = self.codecs.read();
        codecs
            .get(media_type.essence())
            .or_else(|| match media_type.suffix()? {
                "json" => codecs.get(JSON),
                "cbor" => codecs.get(CBOR),
                _ => None,
            })
            .cloned()
    }

    /// The codec for a content type, or the default codec when none matches.
    pub fn codec_for(&self, content_type: &str) -> Arc<dyn ContentCodec> {
        let media_type = MediaType::parse(content_type);
        self.lookup(&media_type).unwrap_or_else(|| {
            debug!(
                content_type,
                fallback = self.default_codec.media_type(),
                "no codec registered, using default"
            );
            Arc::clone(&self.default_codec)
        })
    }

    #[inline]
    pub fn is_supported(&self, content_type: &str) -> bool {
        self.lookup(&MediaType::parse(content_type)).is_some()
    }

    /// Registered media types, sorted.
    pub fn supported_media_types(&self) -> Vec<String> {
        let mut media_types: Vec<_> = self.codecs.read().keys().cloned().collect();
        media_types.sort_unstable();
        media_types
    }

    /// Encode a value, `application/json` when no content type is given.
    pub fn value_to_content(
        &self,
        value: &Value,
        schema: Option<&DataSchema>,
        content_type: Option<&str>,
    ) -> Result<Content> {
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        let media_type = MediaType::parse(content_type);
        let body = self
            .codec_for(content_type)
            .value_to_bytes(value, schema, &media_type)?;

        Ok(Content::new(content_type, body))
    }

    pub fn content_to_value(&self, content: &Content, schema: Option<&DataSchema>) -> Result<Value> {
        let media_type = content.media_type();
        self.codec_for(&content.content_type)
            .bytes_to_value(&content.body, schema, &media_type)
    }
}

impl Default for ContentSerdes {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContentSerdes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentSerdes")
            .field("media_types", &self.supported_media_types())
            .field("default", &self.default_codec.media_type())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::thing::{IntegerSchema, NumberSchema, StringSchema};

    fn schema(subtype: DataSchemaSubtype) -> DataSchema {
        DataSchema {
            subtype: Some(subtype),
            ..Default::default()
        }
    }

    #[test]
    fn parse_media_type() {
        let media_type = MediaType::parse("Text/Plain ; Charset=\"UTF-8\"");

        assert_eq!(media_type.essence(), "text/plain");
        assert_eq!(media_type.parameter("charset"), Some("UTF-8"));
        assert_eq!(media_type.suffix(), None);
        assert_eq!(media_type.to_string(), "text/plain;charset=UTF-8");
        assert_eq!(
            MediaType::parse("application/td+json").suffix(),
            Some("json")
        );
    }

    #[test]
    fn json_content() {
        let serdes = ContentSerdes::new();
        let content = serdes
            .value_to_content(&json!({"on": true, "level": 42}), None, None)
            .unwrap();

        assert_eq!(content.content_type, JSON);
        assert_eq!(
            serdes.content_to_value(&content, None).unwrap(),
            json!({"on": true, "level": 42})
        );
        assert_eq!(
            serdes
                .content_to_value(&Content::new(JSON, Bytes::new()), None)
                .unwrap(),
            Value::Null
        );
    }

    #[test]
    fn json_bare_string_with_string_schema() {
        let serdes = ContentSerdes::new();
        let content = Content::new(JSON, "on");

        assert!(serdes.content_to_value(&content, None).is_err());
        assert_eq!(
            serdes
                .content_to_value(
                    &content,
                    Some(&schema(DataSchemaSubtype::String(StringSchema::default())))
                )
                .unwrap(),
            json!("on")
        );
    }

    #[test]
    fn structured_suffix_uses_json() {
        let serdes = ContentSerdes::new();
        let content = Content::new("application/td+json", r#"{"title": "Lamp"}"#);

        assert!(serdes.is_supported("application/td+json"));
        assert_eq!(
            serdes.content_to_value(&content, None).unwrap(),
            json!({"title": "Lamp"})
        );
    }

    #[test]
    fn text_uses_schema() {
        let serdes = ContentSerdes::new();
        let int = schema(DataSchemaSubtype::Integer(IntegerSchema::default()));
        let number = schema(DataSchemaSubtype::Number(NumberSchema::default()));

        assert_eq!(
            serdes
                .content_to_value(&Content::new("text/plain; charset=utf-8", " 25 "), Some(&int))
                .unwrap(),
            json!(25)
        );
        assert_eq!(
            serdes
                .content_to_value(&Content::new(TEXT, "21.5"), Some(&number))
                .unwrap(),
            json!(21.5)
        );
        assert_eq!(
            serdes
                .content_to_value(
                    &Content::new(TEXT, "true"),
                    Some(&schema(DataSchemaSubtype::Boolean))
                )
                .unwrap(),
            json!(true)
        );
        assert_eq!(
            serdes.content_to_value(&Content::new(TEXT, "25"), None).unwrap(),
            json!("25")
        );
        assert!(serdes
            .content_to_value(&Content::new(TEXT, "warm"), Some(&int))
            .is_err());
        assert!(serdes
            .content_to_value(&Content::new("text/plain;charset=utf-16", "25"), None)
            .is_err());

        let content = serdes
            .value_to_content(&json!(25), None, Some(TEXT))
            .unwrap();
        assert_eq!(content.body, Bytes::from_static(b"25"));
    }

    #[test]
    fn cbor_content() {
        let serdes = ContentSerdes::new();
        let value = json!({"temperature": 21.5, "unit": "celsius", "history": [1, 2, 3]});
        let content = serdes.value_to_content(&value, None, Some(CBOR)).unwrap();

        assert_ne!(content.body, serde_json::to_vec(&value).unwrap());
        assert_eq!(serdes.content_to_value(&content, None).unwrap(), value);
    }

    #[test]
    fn unknown_media_type_falls_back_to_octet_stream() {
        let serdes = ContentSerdes::new();

        assert!(!serdes.is_supported("image/png"));
        assert_eq!(serdes.codec_for("image/png").media_type(), OCTET_STREAM);
        assert_eq!(
            serdes
                .content_to_value(&Content::new("image/png", vec![0xff, 0x00, 0x10]), None)
                .unwrap(),
            json!([255, 0, 16])
        );
        assert_eq!(
            serdes
                .value_to_content(&json!([255, 0, 16]), None, Some("image/png"))
                .unwrap()
                .body,
            Bytes::from_static(&[0xff, 0x00, 0x10])
        );
        assert!(serdes
            .value_to_content(&json!([256]), None, Some(OCTET_STREAM))
            .is_err());
    }

    #[test]
    fn register_replaces_previous_codec() {
        struct Shouting;

        impl ContentCodec for Shouting {
            fn media_type(&self) -> &str {
                TEXT
            }

            fn bytes_to_value(
                &self,
                bytes: &[u8],
                _schema: Option<&DataSchema>,
                _media_type: &MediaType,
            ) -> Result<Value> {
                Ok(Value::String(
                    String::from_utf8_lossy(bytes).to_uppercase(),
                ))
            }

            fn value_to_bytes(
                &self,
                value: &Value,
                _schema: Option<&DataSchema>,
                _media_type: &MediaType,
            ) -> Result<Bytes> {
                Ok(Bytes::from(value.to_string()))
            }
        }

        let serdes = ContentSerdes::new();
        serdes.register(Arc::new(Shouting));

        assert_eq!(
            serdes
                .content_to_value(&Content::new(TEXT, "hello"), None)
                .unwrap(),
            json!("HELLO")
        );
        assert_eq!(
            serdes.supported_media_types(),
            vec![CBOR, JSON, OCTET_STREAM, TEXT]
        );
    }
}
