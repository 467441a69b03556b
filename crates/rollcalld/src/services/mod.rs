//! HTTP clients for the external collaborators.

pub mod ledger_client;
pub mod resolver_client;

pub use ledger_client::LedgerGatewayClient;
pub use resolver_client::HttpResolver;
