pub mod config;
pub mod descriptor;
pub mod registry;
pub mod yaml;

pub use config::{
    ConfigError, ModelAliasConfig, ProviderConfig, RoutingTable, TransformerOverrides,
    TransformerSpec, UserConfig,
};
pub use descriptor::{
    Capabilities, Channel, OperationKind, OperationSpec, ProviderDescriptor, ProviderKind,
    descriptor,
};
pub use registry::{RegistryError, TransformerRegistry};
