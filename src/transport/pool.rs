use crate::config::Properties;
use crate::error::{TransportError, TransportResult};
use crate::transport::{Transport, TransportCreator, TransportKind};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

struct Entries {
    transports: AHashMap<TransportKind, Arc<dyn Transport>>,
    default_kind: Option<TransportKind>,
}

/// Lazy, deduplicated pool of transport instances, keyed by kind.
///
/// Every operation takes the single pool mutex, so interrupt/resume/reset
/// broadcasts are atomic with respect to concurrent additions.
pub struct TransportPool {
    creator: Arc<TransportCreator>,
    entries: Mutex<Entries>,
}

impl TransportPool {
    pub fn new(creator: Arc<TransportCreator>) -> Self {
        Self {
            creator,
            entries: Mutex::new(Entries {
                transports: AHashMap::new(),
                default_kind: None,
            }),
        }
    }

    /// Configure what `TransportKind::Default` resolves to; set by the
    /// driver before any channel transport is added.
    pub fn set_default_kind(&self, kind: TransportKind) {
        self.entries.lock().default_kind = Some(kind);
    }

    /// Return the pooled transport for `kind`, creating it on first use.
    /// `Default` resolves to the configured device default.
    pub fn add(
        &self,
        kind: TransportKind,
        device_id: &str,
        config: &Properties,
    ) -> TransportResult<Arc<dyn Transport>> {
        let mut entries = self.entries.lock();

        let kind = if kind == TransportKind::Default {
            entries.default_kind.ok_or_else(|| {
                TransportError::Fault("no default transport kind configured".into())
            })?
        } else {
            kind
        };

        if let Some(existing) = entries.transports.get(&kind) {
            tracing::debug!("reusing existing '{kind}' transport");
            return Ok(existing.clone());
        }

        tracing::debug!("adding '{kind}' transport");
        let transport = (self.creator)(kind, device_id, config)?;
        entries.transports.insert(kind, transport.clone());
        Ok(transport)
    }

    /// Pooled transport for `kind` if it was already created.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.entries.lock().transports.get(&kind).cloned()
    }

    /// Abort in-flight blocking operations on every pooled transport.
    pub fn interrupt_all(&self) {
        for transport in self.entries.lock().transports.values() {
            transport.interrupt();
        }
    }

    /// Re-arm blocking operations on every pooled transport.
    pub fn resume_all(&self) {
        for transport in self.entries.lock().transports.values() {
            transport.resume();
        }
    }

    /// Finalize and drop every pooled transport.
    pub fn reset(&self) {
        let mut entries = self.entries.lock();
        for transport in entries.transports.values() {
            transport.reset();
        }
        entries.transports.clear();
        entries.default_kind = None;
    }
}
