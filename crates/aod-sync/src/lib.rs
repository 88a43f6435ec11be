//! Scheduling, transform and merge pipeline for staged source documents.

pub mod batch;
pub mod config;
pub mod domain_upsert;
pub mod producer;
pub mod rules;
pub mod scheduler;
pub mod transform;
pub mod upsert;
pub mod worker;

pub use batch::{BatchReport, BatchTransformRunner};
pub use config::SyncConfig;
pub use domain_upsert::{CoercionError, GenericDomainUpserter, TypeHint};
pub use producer::JobProducer;
pub use rules::{MappingRule, RuleError, RuleLoader, RuleRegistry};
pub use scheduler::{AdmissionControl, AdmissionScheduler, InFlightGuard, RoundReport};
pub use transform::{TransformEngine, TransformOutput};
pub use upsert::{UpsertOutcome, UpsertService};
pub use worker::Pipeline;

pub const CRATE_NAME: &str = "aod-sync";
