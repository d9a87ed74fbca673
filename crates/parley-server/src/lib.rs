pub mod client;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod session;
pub mod translate;
pub mod transport;

pub use client::{ClientId, ClientRegistry};
pub use error::ServerError;
pub use orchestrator::{PendingRequest, SessionOrchestrator};
pub use protocol::{parse_client_event, ClientEnvelope, ProtocolError, ServerEventType, ServiceEnvelope};
pub use server::{start, ServerConfig, ServerHandle, DEFAULT_PORT, DEFAULT_WS_PATH};
pub use session::{EventBus, RuntimeSession, SessionPhase};
pub use transport::{ClientTransport, RecordingTransport};
