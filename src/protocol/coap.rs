//! CoAP Binding Template

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::FormExtension;
use crate::thing::FormOperation;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Patch,
    #[serde(rename = "iPATCH")]
    Ipatch,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
pub struct BlockWiseTransferParameters {
    #[serde(rename = "cov:block2SZX")]
    pub block_2szx: Option<u16>,
    #[serde(rename = "cov:block1SZX")]
    pub block_1szx: Option<u16>,
}

/// CoAP terms of a Form
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
pub struct CoapForm {
    #[serde(rename = "cov:method")]
    pub method: Option<Method>,
    #[serde(rename = "cov:blockwise")]
    pub blockwise: Option<BlockWiseTransferParameters>,
    #[serde(rename = "cov:qblockwise")]
    pub qblockwise: Option<BlockWiseTransferParameters>,
    #[serde(rename = "cov:hopLimit")]
    pub hop_limit: Option<u8>,
}

impl CoapForm {
    /// The method to use for `op`, falling back to the binding defaults.
    ///
    /// Observations and event subscriptions are `GET` requests carrying the Observe option.
    pub fn method_for(&self, op: FormOperation) -> Method {
        use FormOperation::*;

        self.method.unwrap_or(match op {
            WriteProperty | WriteAllProperties | WriteMultipleProperties => Method::Put,
            InvokeAction => Method::Post,
            CancelAction => Method::Delete,
            _ => Method::Get,
        })
    }

    /// Whether `op` keeps an Observe relationship open.
    pub fn is_observation(op: FormOperation) -> bool {
        matches!(
            op,
            FormOperation::ObserveProperty
                | FormOperation::ObserveAllProperties
                | FormOperation::SubscribeEvent
                | FormOperation::SubscribeAllEvents
        )
    }
}

impl FormExtension for CoapForm {
    const PREFIX: &'static str = "cov";
    const IRI: &'static str = "http://www.example.org/coap-binding#";
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::thing::{DefaultedFormOperations, Form};

    fn deserialize_form(s: &str, expected: CoapForm) -> Form {
        let form: Form = serde_json::from_str(s).unwrap();
        assert_eq!(form.extension::<CoapForm>().unwrap(), expected);
        form
    }

    #[test]
    fn deserialize_observe() {
        let form = deserialize_form(
            r#"
            {
                "cov:method": "GET",
                "href": "coap://[2001:DB8::1]/status",
                "contentType": "text/plain;charset=utf-8",
                "subprotocol": "cov:observe",
                "op": ["observeproperty"]
            }
            "#,
            CoapForm {
                method: Some(Method::Get),
                ..Default::default()
            },
        );

        assert_eq!(
            form.op,
            DefaultedFormOperations::Custom(vec![FormOperation::ObserveProperty])
        );
        assert_eq!(form.scheme(), Some("coap"));
        assert_eq!(form.subprotocol.as_deref(), Some("cov:observe"));
    }

    #[test]
    fn deserialize_blockwise() {
        deserialize_form(
            r#"
            {
                "href": "coap://[2001:DB8::1]/status",
                "cov:blockwise": { },
                "cov:qblockwise": {
                    "cov:block2SZX": 64
                }
            }
            "#,
            CoapForm {
                blockwise: Some(BlockWiseTransferParameters::default()),
                qblockwise: Some(BlockWiseTransferParameters {
                    block_2szx: Some(64),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
    }

    #[test]
    fn deserialize_hop_limit() {
        deserialize_form(
            r#"
            {
                "href": "coap://[2001:DB8::1]/status",
                "cov:method": "iPATCH",
                "cov:hopLimit": 5
            }
            "#,
            CoapForm {
                method: Some(Method::Ipatch),
                hop_limit: Some(5),
                ..Default::default()
            },
        );
    }

    #[test]
    fn default_methods() {
        let form = CoapForm::default();
        assert_eq!(form.method_for(FormOperation::ReadProperty), Method::Get);
        assert_eq!(form.method_for(FormOperation::ObserveProperty), Method::Get);
        assert_eq!(form.method_for(FormOperation::WriteProperty), Method::Put);
        assert_eq!(form.method_for(FormOperation::InvokeAction), Method::Post);

        let form = CoapForm {
            method: Some(Method::Ipatch),
            ..Default::default()
        };
        assert_eq!(form.method_for(FormOperation::WriteProperty), Method::Ipatch);

        assert!(CoapForm::is_observation(FormOperation::SubscribeEvent));
        assert!(!CoapForm::is_observation(FormOperation::ReadProperty));
    }
}
