//! 凭据池、并发准入与调度
//!
//! 上游凭据的轮询选择、每凭据并发额度的原子准入控制，以及二者的组合调度。

pub mod admission;
pub mod dispatcher;
pub mod pool;

pub use admission::{AdmissionController, AdmissionSnapshot};
pub use dispatcher::{AdmissionGuard, Dispatcher};
pub use pool::{Credential, CredentialPatch, CredentialPool};
