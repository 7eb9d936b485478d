use std::fmt;

/// Broker connection configuration. Equality-comparable on purpose: two
/// transport ids resolving to equal `TransportInfo` values share one
/// underlying transport instance, so this type is the transport cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportInfo {
    pub broker: String,
    pub login: String,
    pub password: String,
    pub environment: String,
    /// Name of the transport factory kind ("in-memory", "rabbitmq", ...).
    pub messaging: String,
}

impl TransportInfo {
    pub fn new(
        broker: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
        environment: impl Into<String>,
        messaging: impl Into<String>,
    ) -> Self {
        TransportInfo {
            broker: broker.into(),
            login: login.into(),
            password: password.into(),
            environment: environment.into(),
            messaging: messaging.into(),
        }
    }
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of log output.
        write!(
            f,
            "{} ({} as {})",
            self.broker, self.messaging, self.login
        )
    }
}
