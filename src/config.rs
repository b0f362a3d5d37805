//! Servient configuration
//!
//! The configuration is a JSON document:
//!
//! ```json
//! {
//!     "servient": { "clientOnly": false, "staticAddress": "192.168.1.10" },
//!     "credentials": {
//!         "urn:dev:ops:my-lamp-1234": { "username": "admin", "password": "secret" }
//!     },
//!     "http": { "port": 8080 }
//! }
//! ```
//!
//! Every top-level section other than `servient` and `credentials` belongs to the protocol
//! binding registered for the scheme with the same name, see [`ServientConfig::binding_section`].

use std::{collections::HashMap, fs::File, io::BufReader, path::Path, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServientConfig {
    #[serde(default)]
    pub servient: ServientSection,

    /// Credentials by Thing id
    #[serde(default)]
    pub credentials: HashMap<String, Credentials>,

    /// Protocol binding sections, by scheme
    #[serde(flatten)]
    pub bindings: Map<String, Value>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServientSection {
    /// Do not start any server, the servient only consumes Things
    #[serde(default)]
    pub client_only: bool,

    /// Address the servers should advertise in the forms they generate
    pub static_address: Option<String>,
}

/// Secrets matching the security schemes of a Thing
#[skip_serializing_none]
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub identity: Option<String>,
    pub psk: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

// Secrets stay out of the logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |field: &Option<String>| field.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("token", &redact(&self.token))
            .field("identity", &self.identity)
            .field("psk", &redact(&self.psk))
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .finish()
    }
}

impl ServientConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Decode the section of a protocol binding, `None` when the section is absent.
    pub fn binding_section<T>(&self, scheme: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.bindings
            .get(scheme)
            .map(|section| serde_json::from_value(section.clone()))
            .transpose()
            .map_err(Error::from)
    }
}

impl FromStr for ServientConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
