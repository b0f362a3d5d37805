//! HTTP Binding Template

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::FormExtension;
use crate::thing::FormOperation;

/// HTTP request method
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Patch,
}

impl Method {
    /// Method implied by the operation when the form does not specify one.
    pub fn default_for(op: FormOperation) -> Self {
        use FormOperation::*;

        match op {
            WriteProperty | WriteAllProperties | WriteMultipleProperties => Self::Put,
            InvokeAction => Self::Post,
            CancelAction => Self::Delete,
            _ => Self::Get,
        }
    }
}

/// HTTP Header
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
pub struct MessageHeader {
    #[serde(rename = "htv:fieldName")]
    pub field_name: Option<String>,
    #[serde(rename = "htv:fieldValue")]
    pub field_value: Option<String>,
}

/// HTTP terms of a Form
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, Hash)]
pub struct HttpForm {
    #[serde(rename = "htv:methodName")]
    pub method_name: Option<Method>,
    #[serde(rename = "htv:headers", default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<MessageHeader>,
}

impl HttpForm {
    /// The method to use for `op`, falling back to the binding defaults.
    pub fn method_for(&self, op: FormOperation) -> Method {
        self.method_name.unwrap_or_else(|| Method::default_for(op))
    }
}

impl FormExtension for HttpForm {
    const PREFIX: &'static str = "htv";
    const IRI: &'static str = "http://www.w3.org/2011/http#";
}
