use std::collections::HashMap;

use crate::contract::TransportInfo;

use super::TransportResolver;

/// Resolver backed by a fixed id-to-configuration map, assembled at startup.
#[derive(Default)]
pub struct StaticTransportResolver {
    transports: HashMap<String, TransportInfo>,
}

impl StaticTransportResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport_id: impl Into<String>, info: TransportInfo) -> Self {
        self.transports.insert(transport_id.into(), info);
        self
    }

    pub fn add_transport(&mut self, transport_id: impl Into<String>, info: TransportInfo) {
        self.transports.insert(transport_id.into(), info);
    }
}

impl TransportResolver for StaticTransportResolver {
    fn get_transport(&self, transport_id: &str) -> Option<TransportInfo> {
        self.transports.get(transport_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_ids_only() {
        let resolver = StaticTransportResolver::new().with_transport(
            "main",
            TransportInfo::new("localhost", "guest", "guest", "dev", "in-memory"),
        );

        assert!(resolver.get_transport("main").is_some());
        assert!(resolver.get_transport("unknown").is_none());
    }
}
