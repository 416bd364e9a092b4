//! Narrow interfaces to the collaborators a pipeline pushes results into:
//! output sinks, row loaders and remote connections.

pub mod loader;
pub mod remote;
pub mod sink;

pub use loader::{IndexedLoader, IndexedTable, Loader, MemoryTable, Row, push_logged};
pub use remote::{ConnectionState, Envelope, LoopbackConnection, RemoteConnection, request_goal};
pub use sink::{Output, Renderer, Sink, TextSink};
