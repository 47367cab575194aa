//! Dynamic challenge instance orchestration.
//!
//! Provisions per-team ephemeral challenge containers, keeps a reverse
//! proxy's routes synchronized with their lifecycle, and bridges browser
//! WebSocket terminals into the containers.
//!
//! ## Module Structure
//!
//! - `config`: Environment-driven configuration
//! - `error`: Error taxonomy
//! - `instance`: Instance model, state graph, hostname derivation
//! - `registry`: Durable instance + route registry (SQLite)
//! - `template`: Proxy route config rendering
//! - `proxy`: Proxy synchronizer (publish/retract, debounced reload)
//! - `runtime`: Container runtime seam (Docker)
//! - `watcher`: Lifecycle watcher (events + reconciliation)
//! - `manager`: Instance manager (request/stop/TTL sweep)
//! - `terminal`: Browser terminal bridge
//! - `server`: HTTP control surface

pub mod config;
pub mod error;
pub mod instance;
pub mod manager;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod template;
pub mod terminal;
pub mod watcher;

pub use config::InstancerConfig;
pub use error::{InstancerError, Result};
pub use instance::{Instance, InstanceState, ProxyRecord};
pub use manager::{ChallengeSpec, InstanceManager};
pub use registry::Registry;
