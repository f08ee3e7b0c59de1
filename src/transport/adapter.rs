//! Collaborator surface for producer and consumer adapters

/// Receives traffic for one interface.
///
/// Callbacks run on the transport task and must return quickly; hand heavy
/// work to another task.
pub trait InterfaceAdapter: Send + Sync {
    /// A value arrived on `path`. `payload` is the raw BSON document.
    fn on_receive(&self, interface: &str, path: &str, payload: &[u8]);

    /// The server removed the property at `path`.
    fn on_unset(&self, interface: &str, path: &str);

    /// A `Retention::Discard` message could not be published and was dropped.
    fn on_publish_error(&self, interface: &str, path: &str, payload: &[u8]) {
        let _ = (interface, path, payload);
    }
}
