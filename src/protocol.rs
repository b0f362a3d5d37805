//! Binding Templates Protocol Extensions
//!
//! Application layer [protocol specific templates](https://w3c.github.io/wot-binding-templates):
//! > Most protocols have a relatively small set of methods that define
//! the message type, the semantic intention of the message.
//!
//! Forms keep the protocol terms untouched, the types of this module give a protocol binding a
//! typed view over them through [`Form::extension`](crate::thing::Form::extension).

use serde::{de::DeserializeOwned, Serialize};

use crate::thing::Form;

pub mod coap;
pub mod http;
pub mod mqtt;

/// Protocol specific terms of a [`Form`](crate::thing::Form)
pub trait FormExtension: Serialize + DeserializeOwned {
    /// Compact IRI prefix used by the terms, e.g. `mqv`
    const PREFIX: &'static str;

    /// IRI the prefix expands to in the `@context`
    const IRI: &'static str;
}

const KNOWN_EXTENSIONS: [(&str, &str); 3] = [
    (http::HttpForm::PREFIX, http::HttpForm::IRI),
    (coap::CoapForm::PREFIX, coap::CoapForm::IRI),
    (mqtt::MqttForm::PREFIX, mqtt::MqttForm::IRI),
];

/// The `@context` prefixes, with their IRIs, of the known protocol terms used by `form`.
pub fn context_entries(form: &Form) -> Vec<(&'static str, &'static str)> {
    KNOWN_EXTENSIONS
        .into_iter()
        .filter(|(prefix, _)| {
            form.other
                .keys()
                .any(|term| term.split_once(':').map_or(false, |(p, _)| p == *prefix))
        })
        .collect()
}
