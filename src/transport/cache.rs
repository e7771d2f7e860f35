//! Per-fingerprint transport cache.
//!
//! # Responsibilities
//! - Hand out one shared transport per parsed fingerprint
//! - Keep lookups lock-free on the hot path
//! - Bound the number of cached transports
//!
//! # Design Decisions
//! - Keys are parsed fingerprints, so spelling variants of one JA3 share a slot
//! - Empty, unparseable and unsatisfiable identifiers all get the one default
//!   transport and never occupy a slot
//! - The map is replaced wholesale on insert (copy-on-write via `ArcSwap::rcu`);
//!   readers never block and never see a partially built map
//! - Two tunnels racing on the same new fingerprint both end up with the
//!   transport that won the insert
//! - Once full, unseen fingerprints get a fresh uncached transport

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use http::header::{HeaderValue, InvalidHeaderValue};
use rustls::RootCertStore;
use thiserror::Error;

use super::fingerprint::{self, FingerprintError, TlsFingerprint};
use super::{FingerprintedTransport, TransportFactory};
use crate::config::ProxyConfig;
use crate::observability::metrics;

type TransportMap = HashMap<TlsFingerprint, Arc<FingerprintedTransport>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid client signature: {0}")]
    ClientSignature(#[from] InvalidHeaderValue),
    #[error("default TLS profile: {0}")]
    DefaultProfile(#[from] FingerprintError),
}

pub struct TransportCache {
    transports: ArcSwap<TransportMap>,
    default: Arc<FingerprintedTransport>,
    roots: Arc<RootCertStore>,
    client_signature: HeaderValue,
    timeout: Duration,
    capacity: usize,
}

impl TransportCache {
    pub fn new(client_signature: HeaderValue, timeout: Duration, capacity: usize) -> Result<Self, CacheError> {
        Self::with_roots(fingerprint::webpki_roots(), client_signature, timeout, capacity)
    }

    /// Cache whose transports trust `roots` instead of the bundled root program.
    fn with_roots(
        roots: Arc<RootCertStore>,
        client_signature: HeaderValue,
        timeout: Duration,
        capacity: usize,
    ) -> Result<Self, CacheError> {
        let default = FingerprintedTransport::new(
            Arc::new(fingerprint::default_config(roots.clone())?),
            client_signature.clone(),
            timeout,
        );
        Ok(Self {
            transports: ArcSwap::from_pointee(TransportMap::new()),
            default: Arc::new(default),
            roots,
            client_signature,
            timeout,
            capacity,
        })
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, CacheError> {
        Self::new(
            HeaderValue::from_str(&config.upstream.client_signature)?,
            config.timeouts.request(),
            config.upstream.max_cached_transports,
        )
    }

    fn get(&self, fingerprint: &TlsFingerprint) -> Option<Arc<FingerprintedTransport>> {
        self.transports.load().get(fingerprint).cloned()
    }

    fn len(&self) -> usize {
        self.transports.load().len()
    }

    fn insert(&self, identifier: &str, fingerprint: TlsFingerprint, created: Arc<FingerprintedTransport>) -> Arc<FingerprintedTransport> {
        let mut chosen = Arc::clone(&created);
        let mut inserted = false;

        self.transports.rcu(|current| {
            if let Some(existing) = current.get(&fingerprint) {
                chosen = Arc::clone(existing);
                inserted = false;
                return Arc::clone(current);
            }
            chosen = Arc::clone(&created);
            if current.len() >= self.capacity {
                inserted = false;
                return Arc::clone(current);
            }
            inserted = true;
            let mut next = TransportMap::clone(current);
            next.insert(fingerprint.clone(), Arc::clone(&created));
            Arc::new(next)
        });

        if inserted {
            let size = self.len();
            tracing::debug!(fingerprint = %identifier, cache_size = size, "Cached new transport");
            metrics::record_transport_cache_size(size);
        } else if Arc::ptr_eq(&chosen, &created) {
            tracing::debug!(
                fingerprint = %identifier,
                capacity = self.capacity,
                "Transport cache full, using uncached transport"
            );
        }
        chosen
    }
}

impl TransportFactory for TransportCache {
    type Transport = FingerprintedTransport;

    fn transport(&self, identifier: &str) -> Arc<FingerprintedTransport> {
        let Some(fingerprint) = fingerprint::parse_identifier(identifier) else {
            return Arc::clone(&self.default);
        };
        if let Some(hit) = self.get(&fingerprint) {
            return hit;
        }

        let tls = match fingerprint::build_config(&fingerprint, self.roots.clone()) {
            Ok(tls) => tls,
            Err(e) => {
                tracing::warn!(fingerprint = %identifier, error = %e, "Unusable TLS fingerprint, using default profile");
                return Arc::clone(&self.default);
            }
        };
        let created = Arc::new(FingerprintedTransport::new(
            Arc::new(tls),
            self.client_signature.clone(),
            self.timeout,
        ));
        self.insert(identifier, fingerprint, created)
    }
}
