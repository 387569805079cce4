pub mod billing;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extractor;
pub mod hypervisor;
pub mod ledger;
pub mod orchestrator;
pub mod retry;
pub mod routes;
