//! Tender ledger persistence + HTTP fetch utilities for Tender Scout.

pub mod http;
pub mod ledger;

pub use http::{
    is_transient_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy,
};
pub use ledger::{DeliveryOutcome, Ledger, LedgerError, Sighting};

pub const CRATE_NAME: &str = "tscout-storage";
