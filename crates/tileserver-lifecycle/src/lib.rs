//! Certificate lifecycle: obtain, serve, renew and hand off between secure generations
//!
//! [`RenewalMachine`] decides what happens next; [`CertificateLifecycleManager`]
//! carries it out. Steer a running manager through its [`LifecycleController`].
//!
//! ```ignore
//! let manager = CertificateLifecycleManager::new(config, store, solver, supervisor)?;
//! let controller = manager.controller();
//! let run = tokio::spawn(manager.run());
//!
//! controller.force_renewal();
//! controller.shutdown();
//! let report = run.await??;
//! ```

pub mod machine;
pub mod manager;

pub use machine::{
    Action, CacheStatus, ExitReason, Input, LifecycleState, RenewalEvent, RenewalMachine,
    TransitionError,
};
pub use manager::{
    CertificateLifecycleManager, LifecycleConfig, LifecycleController, LifecycleError,
    LifecycleEvent, LifecycleReport,
};
