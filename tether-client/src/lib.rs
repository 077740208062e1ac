//! # tether-client
//!
//! Client side of the Tether transport:
//! - [`ClientSession`]: one logical connection with its pumps and pending-request table
//! - [`ReconnectSupervisor`]: keeps a session alive and drives the connection state machine
//! - [`StressHarness`]: synthetic workloads with latency and throughput reporting

pub mod events;
pub mod pending;
pub mod session;
pub mod stress;
pub mod supervisor;

pub use events::{Direction, SessionEvent};
pub use pending::{PendingAck, PendingRequests};
pub use session::{ClientSession, SessionOptions};
pub use stress::{MixWeights, StressConfig, StressHarness, StressOperation, StressReport};
pub use supervisor::{ReconnectSupervisor, SupervisorConfig};
