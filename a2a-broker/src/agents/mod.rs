pub mod heartbeat;
pub mod registry;

pub use heartbeat::{HeartbeatMonitor, RegistryConfig};
pub use registry::AgentRegistry;
