//! Bridge counters
//!
//! Each counter is incremented once per observed event and never affects
//! control flow. The counters live outside any registry so a bridge works
//! without metrics export; [`BridgeMetrics::register`] publishes them.

use prometheus::{IntCounter, Registry};
use std::collections::BTreeMap;

pub const HTTP_PROXY_REJECT: &str = "http_proxy_reject";
pub const HTTP_PROXY_DELEGATE: &str = "http_proxy_delegate";
pub const FWD_CONN_REJECT: &str = "fwd_conn_reject";
pub const FWD_CONN_ERROR: &str = "fwd_conn_error";
pub const FWD_CONN_SPLICE: &str = "fwd_conn_splice";
pub const PROXY_CONN_REQUEST: &str = "proxy_conn_request";
pub const PROXY_CONN_ERROR: &str = "proxy_conn_error";
pub const PROXY_CONN_ACCEPT: &str = "proxy_conn_accept";

pub struct BridgeMetrics {
    pub(crate) http_proxy_reject: IntCounter,
    pub(crate) http_proxy_delegate: IntCounter,
    pub(crate) fwd_conn_reject: IntCounter,
    pub(crate) fwd_conn_error: IntCounter,
    pub(crate) fwd_conn_splice: IntCounter,
    pub(crate) proxy_conn_request: IntCounter,
    pub(crate) proxy_conn_error: IntCounter,
    pub(crate) proxy_conn_accept: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("counter names are valid metric names")
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            http_proxy_reject: counter(HTTP_PROXY_REJECT, "Plain HTTP requests rejected"),
            http_proxy_delegate: counter(HTTP_PROXY_DELEGATE, "Plain HTTP requests delegated"),
            fwd_conn_reject: counter(FWD_CONN_REJECT, "Unclaimed CONNECT requests rejected"),
            fwd_conn_error: counter(FWD_CONN_ERROR, "Unclaimed CONNECT requests failed"),
            fwd_conn_splice: counter(FWD_CONN_SPLICE, "Unclaimed CONNECT requests spliced"),
            proxy_conn_request: counter(PROXY_CONN_REQUEST, "Matching CONNECT requests"),
            proxy_conn_error: counter(PROXY_CONN_ERROR, "Matching CONNECT requests failed"),
            proxy_conn_accept: counter(PROXY_CONN_ACCEPT, "Matching CONNECT requests accepted"),
        }
    }

    fn all(&self) -> [(&'static str, &IntCounter); 8] {
        [
            (HTTP_PROXY_REJECT, &self.http_proxy_reject),
            (HTTP_PROXY_DELEGATE, &self.http_proxy_delegate),
            (FWD_CONN_REJECT, &self.fwd_conn_reject),
            (FWD_CONN_ERROR, &self.fwd_conn_error),
            (FWD_CONN_SPLICE, &self.fwd_conn_splice),
            (PROXY_CONN_REQUEST, &self.proxy_conn_request),
            (PROXY_CONN_ERROR, &self.proxy_conn_error),
            (PROXY_CONN_ACCEPT, &self.proxy_conn_accept),
        ]
    }

    /// Registers every counter with `registry`. The caller owns the export.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for (_, c) in self.all() {
            registry.register(Box::new(c.clone()))?;
        }
        Ok(())
    }

    /// Current value of the counter called `name`.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.all()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| c.get())
    }

    /// Point-in-time copy of all counters keyed by name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.all().into_iter().map(|(n, c)| (n, c.get())).collect()
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
