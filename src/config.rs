//! Discovery target configuration.

/// Port specification for the gRPC service.
///
/// Determines how a port number is chosen from each endpoint subset's port
/// list when resolving dialable addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Port {
    /// Use the first port entry of each subset, in the order the registry
    /// delivered them.
    First,
    /// A named port, matched against the subset's port names.
    Name(String),
    /// A literal port number, used without consulting the subset's ports.
    Number(u16),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Configuration for Kubernetes endpoint discovery.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// The Kubernetes service name to watch.
    pub service_name: String,

    /// The Kubernetes namespace where the service is deployed.
    /// If `None`, uses the current namespace from the kube client.
    pub namespace: Option<String>,

    /// The port for the gRPC service (number, name, or first-found).
    pub port: Port,
}

impl DiscoveryConfig {
    /// Creates a new discovery configuration.
    ///
    /// The port can be specified as a number (`50051`), a name (`"grpc"`),
    /// or [`Port::First`] to take whichever port each subset lists first.
    /// Uses the current namespace from the kube client configuration.
    #[must_use]
    pub fn new(service_name: impl Into<String>, port: impl Into<Port>) -> Self {
        Self {
            service_name: service_name.into(),
            namespace: None,
            port: port.into(),
        }
    }

    /// Sets an explicit namespace for the service.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}
