use std::fmt;

/// A transport-addressable publish/subscribe pair. The two addresses differ
/// when request/reply traffic flows through asymmetric routes; for plain
/// queues they are the same string.
///
/// The string form doubles as the default processing-group key when a caller
/// does not name one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub publish: String,
    pub subscribe: String,
}

impl Destination {
    pub fn new(publish: impl Into<String>, subscribe: impl Into<String>) -> Self {
        Destination {
            publish: publish.into(),
            subscribe: subscribe.into(),
        }
    }
}

impl From<&str> for Destination {
    fn from(address: &str) -> Self {
        Destination {
            publish: address.to_string(),
            subscribe: address.to_string(),
        }
    }
}

impl From<String> for Destination {
    fn from(address: String) -> Self {
        Destination {
            publish: address.clone(),
            subscribe: address,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.publish == self.subscribe {
            write!(f, "[{}]", self.subscribe)
        } else {
            write!(f, "[s:{}, p:{}]", self.subscribe, self.publish)
        }
    }
}
