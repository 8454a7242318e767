//! tether core types: workload identity, catalog payloads, credentials and config.
//!
//! Everything in here is plain data. Network clients live in `tether-consul`
//! and `tether-kubehub`; the two flows that use them live in
//! `tether-meshinit` and `tether-controller`.

#![forbid(unsafe_code)]

pub mod config;
pub mod model;
pub mod retry;

pub use config::{Config, ConfigError, Mode};
pub use model::*;
pub use retry::{retry_notify, Backoff};

pub mod prelude {
    pub use super::config::{Config, ConfigError, Mode};
    pub use super::model::{
        AgentService, CatalogEntry, Credential, CredentialRequest, HealthCheck, Locality,
        RegistrationIntent, SecretRecord, ServiceAddress, ServiceKind, WorkloadFamily,
        WorkloadInstance,
    };
    pub use super::retry::{retry_notify, Backoff};
}
