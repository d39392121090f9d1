pub mod engine;
pub mod interpreter;
pub mod projector;
pub mod protocol;
pub mod registry;

pub use engine::{Dispatch, Engine};
pub use interpreter::{interpret, mark_pending, Notification, Transition};
pub use projector::{ConnectionStatus, ViewProjector};
pub use protocol::{
    decode_update, encode_command, Command, LifecycleKind, ProtocolError, TestDuration,
    TestIdentity, Update, UpdateKind,
};
pub use registry::{
    FieldUpdate, Mutation, Registry, RegistryError, RunSummary, Snapshot, TestGroup, TestRecord,
    TestStatus,
};
