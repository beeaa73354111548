//! I/O node-type backends and the default type registry.

pub mod c37_118;
pub mod file;
pub mod mqtt;
pub mod socket;

use gatewire_core::{LoopbackPlugin, NodeTypeRegistry};

/// Build the registry of every node type this daemon ships.
pub fn registry() -> NodeTypeRegistry {
    let mut registry = NodeTypeRegistry::new();
    registry.register(Box::new(LoopbackPlugin));
    registry.register(Box::new(file::FilePlugin));
    registry.register(Box::new(socket::SocketPlugin));
    registry.register(Box::new(mqtt::MqttPlugin));
    registry.register(Box::new(c37_118::C37Plugin));
    registry
}

#[cfg(test)]
mod tests {
    #[test]
    fn registry_lists_all_types() {
        let registry = super::registry();
        assert_eq!(
            registry.type_names(),
            vec!["c37_118", "file", "loopback", "mqtt", "socket"]
        );
    }
}
