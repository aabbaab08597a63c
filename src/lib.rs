//! Update orchestration agent for a single-host compose stack.
//!
//! The agent watches a release feed for new versions of the stack it runs
//! inside, downloads manifests and images, recreates drifted services and
//! reports its lifecycle through an update entity. Its own container is
//! recreated indirectly through a short-lived helper service.

pub mod compose;
pub mod config;
pub mod entity;
pub mod envfile;
pub mod error;
pub mod reconcile;
pub mod release;
pub mod runtime;
pub mod state;
pub mod updater;

pub use config::Config;
pub use error::UpdaterError;
pub use updater::Updater;
