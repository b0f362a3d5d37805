//! MQTT Binding Template

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, OneOrMany};

use super::FormExtension;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ControlPacket {
    #[serde(rename = "mqv:publish")]
    Publish,
    #[serde(rename = "mqv:subscribe")]
    Subscribe,
    #[serde(rename = "mqv:unsubscribe")]
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    #[default]
    #[serde(rename = "quality:0", alias = "0")]
    AtMostOnce,
    #[serde(rename = "quality:1", alias = "1")]
    AtLeastOnce,
    #[serde(rename = "quality:2", alias = "2")]
    ExactlyOnce,
}

impl QoS {
    /// Numeric level as used on the wire.
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// MQTT terms of a Form
///
/// Both the `mqv:` vocabulary and the older `mqtt:` prefix are accepted.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
pub struct MqttForm {
    #[serde(
        rename = "mqv:retain",
        alias = "mqtt:retain",
        skip_serializing_if = "std::ops::Not::not",
        default
    )]
    pub retain: bool,
    #[serde(rename = "mqv:controlPacket")]
    pub control_packet: Option<ControlPacket>,
    #[serde(rename = "mqv:qos", alias = "mqtt:qos")]
    pub qos: Option<QoS>,
    #[serde(rename = "mqv:topic")]
    pub topic: Option<String>,
    #[serde(rename = "mqv:filter", default, skip_serializing_if = "Vec::is_empty")]
    #[serde_as(as = "OneOrMany<_>")]
    pub filter: Vec<String>,
}

impl MqttForm {
    /// Effective QoS, `AtMostOnce` when unspecified.
    #[inline]
    pub fn qos_or_default(&self) -> QoS {
        self.qos.unwrap_or_default()
    }
}

impl FormExtension for MqttForm {
    const PREFIX: &'static str = "mqv";
    const IRI: &'static str = "http://www.example.org/mqtt-binding#";
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::InteractionKind,
        thing::{DefaultedFormOperations::Custom, Form, FormOperation::*},
    };

    fn extension(s: &str) -> (Form, MqttForm) {
        let form: Form = serde_json::from_str(s).unwrap();
        let ext = form.extension::<MqttForm>().unwrap();
        (form, ext)
    }

    #[test]
    fn simple_filter() {
        let (form, ext) = extension(
            r#"{
                "href": "mqtt://broker.com:1883",
                "op": [
                    "subscribeevent",
                    "unsubscribeevent"
                ],
                "mqv:filter": "thing1/events/overheating"
            }"#,
        );

        assert_eq!(form.op, Custom(vec![SubscribeEvent, UnsubscribeEvent]));
        assert_eq!(
            ext,
            MqttForm {
                filter: vec!["thing1/events/overheating".into()],
                ..Default::default()
            }
        );
        assert_eq!(ext.qos_or_default(), QoS::AtMostOnce);
    }

    #[test]
    fn complex_filter() {
        let (form, ext) = extension(
            r#"{
                "href": "mqtt://broker.com:1883",
                "op": [
                    "readproperty",
                    "observeproperty"
                ],
                "mqv:qos": "quality:1",
                "mqv:retain" : true,
                "mqv:filter": "application/devices/thing1/properties/test"
            }"#,
        );

        assert!(form.supports(InteractionKind::Property, ObserveProperty));
        assert_eq!(
            ext,
            MqttForm {
                qos: Some(QoS::AtLeastOnce),
                retain: true,
                filter: vec!["application/devices/thing1/properties/test".into()],
                ..Default::default()
            }
        );
    }

    #[test]
    fn legacy_prefix() {
        let (_, ext) = extension(
            r#"{
                "href": "mqtt://localhost:1889/test1",
                "mqtt:qos": "2",
                "mqtt:retain": false
            }"#,
        );

        assert_eq!(ext.qos_or_default().level(), 2);
        assert!(!ext.retain);
    }

    #[test]
    fn unrelated_terms_are_ignored() {
        let (_, ext) = extension(
            r#"{
                "href": "mqtt://broker.com:1883",
                "htv:methodName": "GET",
                "mqv:topic": "lamp/on",
                "mqv:controlPacket": "mqv:publish"
            }"#,
        );

        assert_eq!(ext.topic.as_deref(), Some("lamp/on"));
        assert_eq!(ext.control_packet, Some(ControlPacket::Publish));
    }
}
