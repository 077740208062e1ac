//! # tether-server
//!
//! Serving side of the Tether transport.
//!
//! - **Hub**: `BroadcastHub` with JSON, file and byte subscriber registries
//! - **Service**: `TetherService` dispatches calls behind the auth gate
//! - **Files**: `FileStore` for upload, download and list beneath a storage root
//! - **Screen**: `ScreenSource` seam with a synthetic test-pattern source
//! - **Server**: TCP accept loop, one task per link and per call
//! - **Console**: operator commands that trigger broadcasts

pub mod console;
pub mod events;
pub mod files;
pub mod hub;
pub mod screen;
pub mod server;
pub mod service;

pub use events::ServerEvent;
pub use files::FileStore;
pub use hub::{BroadcastHub, BroadcastReport, PushSink, SubscriberInfo, SubscriptionKind};
pub use screen::{ScreenSource, SyntheticScreen};
pub use server::Server;
pub use service::TetherService;
