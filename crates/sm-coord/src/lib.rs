//! sm-coord: the coordination registry agents talk to while they run:
//! presence, file locks, shared interface definitions, and messaging.

pub mod registry;
pub mod rpc;

pub use registry::{CoordinationRegistry, RegistryError, RegistryStats};
pub use rpc::{dispatch, RpcErrorKind, RpcRequest, RpcResponse};
