use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

mod exporter;
mod supplier;

pub use exporter::ExporterMetrics;
pub use supplier::{DynamicSupplier, GaugeSupplier, MeterId};

use supplier::{SupplierFamilies, SupplierFamiliesHandle};

/// Prometheus registry adapter.
///
/// Supplier-backed gauges are registered once per meter identity and read
/// through closures at gather time; native prometheus counters, histograms
/// and gauges register straight into the wrapped registry. Removal by
/// [`MeterId`] supports the deletion-cleanup path of high-churn collectors.
pub struct MeterRegistry {
    registry: Registry,
    suppliers: Arc<SupplierFamilies>,
}

impl MeterRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let suppliers = Arc::new(SupplierFamilies::new()?);
        registry.register(Box::new(SupplierFamiliesHandle(suppliers.clone())))?;
        Ok(Self {
            registry,
            suppliers,
        })
    }

    /// Register a gauge whose value is read from `supplier` on every
    /// gather. Returns the meter identity for later removal.
    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        supplier: impl Fn() -> f64 + Send + Sync + 'static,
    ) -> Result<MeterId> {
        self.suppliers
            .register_gauge(name, help, labels, Arc::new(supplier))
    }

    /// Register a gauge whose label values are recomputed on every gather.
    pub fn register_dynamic_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        supplier: impl Fn() -> (Vec<String>, f64) + Send + Sync + 'static,
    ) -> Result<MeterId> {
        self.suppliers
            .register_dynamic_gauge(name, help, label_names, Arc::new(supplier))
    }

    /// Remove a supplier-backed meter; its series disappears from the next
    /// exposition.
    pub fn remove(&self, id: &MeterId) -> Result<()> {
        self.suppliers.remove(id)
    }

    pub fn contains(&self, id: &MeterId) -> bool {
        self.suppliers.contains(id)
    }

    /// The wrapped registry, for native counter/histogram registration.
    pub fn prometheus(&self) -> &Registry {
        &self.registry
    }

    /// Encode the current registry contents in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
