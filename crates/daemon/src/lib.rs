pub mod folders;
pub mod lifecycle;
pub mod resource;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod tools;

pub use folders::{FolderRegistry, RegistryError};
pub use lifecycle::Daemon;
pub use resource::{AdmitError, Permit, ResourceManager, ThrottleEvent};
pub use router::{Request, Response, Router, RpcError};
pub use scheduler::{FolderResult, FolderScheduler, FolderStatus, IndexOptions, MultiFolderResult};
pub use server::{Server, ShutdownHandle, default_socket_path};
pub use tools::{Envelope, ToolHandler};
