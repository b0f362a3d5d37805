//! Web of Things servient runtime
//!
//! Expose and consume [Things](https://www.w3.org/TR/wot-architecture/) over pluggable
//! protocol bindings:
//! > A Thing is an abstraction of a physical or virtual entity whose metadata and interfaces
//! > are described by a WoT Thing Description.
//!
//! The [`Servient`] owns the protocol bindings, registered by URI scheme, and the exposed
//! Things. An [`ExposedThing`](exposed::ExposedThing) serves properties, actions and events
//! through user handlers, a [`ConsumedThing`](consumed::ConsumedThing) reaches a remote Thing
//! through the forms of its [Thing Description](thing::Thing).
//!
//! Protocol bindings implement the traits of the [`binding`] module and exchange
//! [`Content`](content::Content) payloads, converted by the codecs of the
//! [`ContentSerdes`](content::ContentSerdes) registry.
//!
//! The crate logs through [tracing](https://docs.rs/tracing) and does not install any
//! subscriber.

pub mod binding;
pub mod config;
pub mod consumed;
pub mod content;
pub mod error;
pub mod exposed;
pub mod interaction;
pub mod protocol;
pub mod servient;
pub mod thing;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use servient::{Servient, Wot};
pub use thing::Thing;
