//! flagsync
//!
//! Client runtime for remotely evaluated feature flags: keeps a local
//! snapshot of toggles in sync with the server for the current context,
//! answers evaluations from that snapshot, and reports usage metrics.
//!
//! # Quick Start
//!
//! ```no_run
//! use flagsync::{Bootstrap, ClientConfig, Context, FlagClient, Listener, Toggle};
//!
//! #[tokio::main]
//! async fn main() -> flagsync::Result<()> {
//!     let config = ClientConfig::new(
//!         "my-app",
//!         "https://flags.example.com/api/frontend",
//!         "client-key",
//!     );
//!     let client = FlagClient::new(config)?;
//!
//!     client
//!         .start(
//!             vec![Listener::ready(|| println!("flags ready"))],
//!             Some(Bootstrap::Toggles(vec![Toggle::new("dark-mode", false)])),
//!         )
//!         .await;
//!
//!     client
//!         .set_context(Context::builder().user_id("user-123").build())
//!         .await?;
//!
//!     if client.is_enabled("dark-mode", false) {
//!         println!("dark mode on");
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod core;
pub mod error;
pub mod http;
pub mod types;
mod client;

pub use types::{
    Context, ContextBuilder, FlagState, HeartbeatEvent, ImpressionEvent, Payload, ProxyResponse,
    Status, Toggle, Variant,
};

pub use error::{ErrorCode, FlagSyncError, Result};

pub use core::{
    ClientConfig, ClientConfigBuilder, DataStrategy, EventListener, HeartbeatListener,
    ImpressionListener, LifecycleEvent, Listener, LocalStorageConfig, NetworkEvent,
    ReadyListener, StateListener, ToggleResponse,
};

pub use backup::{BackupStore, Bootstrap, LocalBackup};

pub use http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

pub use client::{FlagClient, SharedClient, FETCH_TOGGLES_JOB, SEND_METRICS_JOB};
