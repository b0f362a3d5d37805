//! Runtime errors
//!
//! Every fallible operation of the servient reports one [`Error`]. Failures raised by user
//! handlers and by protocol collaborators are carried as opaque [`BoxError`]s, the runtime never
//! interprets them.

use std::fmt;

use crate::thing::FormOperation;

/// Opaque error produced outside of the runtime, by handlers or protocol bindings.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shorthand for results using the runtime [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The kind of an interaction affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    Property,
    Action,
    Event,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Property => "property",
            Self::Action => "action",
            Self::Event => "event",
        };

        f.write_str(s)
    }
}

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named interaction is not declared by the Thing.
    #[error("Thing \"{thing}\" has no {kind} \"{name}\"")]
    NotFound {
        thing: String,
        kind: InteractionKind,
        name: String,
    },

    /// The action is declared but nobody registered a handler for it.
    #[error("Thing \"{thing}\" has no handler for action \"{action}\"")]
    NoHandler { thing: String, action: String },

    /// No client or server factory is registered for the URI scheme.
    #[error("No protocol binding registered for scheme \"{0}\"")]
    UnsupportedScheme(String),

    /// A user handler rejected the operation, the stored state is unchanged.
    #[error("Handler for \"{name}\" failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: BoxError,
    },

    /// The operation is not allowed in the current lifecycle state of the target.
    #[error("{target} is {state}")]
    Lifecycle { target: String, state: &'static str },

    /// One or more items of a multi-item operation failed.
    ///
    /// Each entry holds the item name and its own failure.
    #[error("{} operation(s) failed: {}", .0.len(), DisplayFailures(.0))]
    Aggregate(Vec<(String, Error)>),

    /// Failure surfaced by a protocol binding.
    #[error("Transport failure: {0}")]
    Transport(#[source] BoxError),

    /// A payload could not be converted from or to the given media type.
    #[error("Cannot convert content of type \"{media_type}\": {reason}")]
    Codec { media_type: String, reason: String },

    /// The affordance does not allow the requested operation, e.g. writing a `readOnly` property
    /// from the network.
    #[error("Operation {op} on \"{name}\" of Thing \"{thing}\" is not allowed")]
    Forbidden {
        thing: String,
        name: String,
        op: FormOperation,
    },

    /// No exposed Thing is routed under the id.
    #[error("No Thing with id \"{0}\"")]
    UnknownThing(String),

    /// Thing ids must be unique within a servient.
    #[error("A Thing with id \"{0}\" is already registered")]
    DuplicateThing(String),

    /// None of the forms of the interaction can be served by the registered bindings.
    #[error("No usable form of {kind} \"{name}\" for operation {op}")]
    NoForm {
        kind: InteractionKind,
        name: String,
        op: FormOperation,
    },

    /// The form href cannot be resolved to an absolute URI.
    #[error("Invalid href \"{href}\": {source}")]
    InvalidHref {
        href: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a failure coming from a protocol binding.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    /// The per-item failures of an aggregate error.
    pub fn failures(&self) -> Option<&[(String, Error)]> {
        match self {
            Self::Aggregate(failures) => Some(failures),
            _ => None,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

struct DisplayFailures<'a>(&'a [(String, Error)]);

impl fmt::Display for DisplayFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, err) in self.0 {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "\"{name}\": {err}")?;
        }

        Ok(())
    }
}

/// Turn the outcome of a fan-out into a single result.
///
/// Successes are collected in order, failures are reported all together.
pub(crate) fn aggregate<T, I>(results: I) -> Result<Vec<(String, T)>>
where
    I: IntoIterator<Item = (String, Result<T>)>,
{
    let mut values = Vec::new();
    let mut failures = Vec::new();
    for (name, result) in results {
        match result {
            Ok(value) => values.push((name, value)),
            Err(err) => failures.push((name, err)),
        }
    }

    if failures.is_empty() {
        Ok(values)
    } else {
        Err(Error::Aggregate(failures))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregate_reports_every_failure() {
        let results = vec![
            ("a".to_string(), Ok(1)),
            (
                "b".to_string(),
                Err(Error::UnsupportedScheme("xyz".to_string())),
            ),
            ("c".to_string(), Ok(3)),
            (
                "d".to_string(),
                Err(Error::NoHandler {
                    thing: "lamp".to_string(),
                    action: "d".to_string(),
                }),
            ),
        ];

        let err = aggregate(results).unwrap_err();
        let failures = err.failures().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, "b");
        assert_eq!(failures[1].0, "d");
        assert_eq!(
            err.to_string(),
            "2 operation(s) failed: \"b\": No protocol binding registered for scheme \"xyz\"; \
             \"d\": Thing \"lamp\" has no handler for action \"d\""
        );
    }

    #[test]
    fn aggregate_keeps_order_on_success() {
        let results = vec![("a".to_string(), Ok(1)), ("b".to_string(), Ok(2))];

        assert_eq!(
            aggregate(results).unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn display_not_found() {
        let err = Error::NotFound {
            thing: "lamp".to_string(),
            kind: InteractionKind::Property,
            name: "on".to_string(),
        };

        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Thing \"lamp\" has no property \"on\"");
    }
}
