use anyhow::{Result, anyhow};
use prometheus::core::{Collector, Desc};
use prometheus::{GaugeVec, Opts, proto};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock};

/// Reads the current value of a supplier-backed gauge.
pub type GaugeSupplier = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Computes label values and value at gather time. Used for gauges whose
/// tags follow mutable state, e.g. the cluster-state `{version, master,
/// standby}` tag set.
pub type DynamicSupplier = Arc<dyn Fn() -> (Vec<String>, f64) + Send + Sync>;

/// Identity of a registered meter: metric name plus the fully qualified
/// label set (sorted, so label order at the call site does not matter).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeterId {
    name: String,
    labels: Vec<(String, String)>,
}

impl MeterId {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }
}

struct FixedEntry {
    label_values: Vec<String>,
    supplier: GaugeSupplier,
}

/// One metric family backed by suppliers. All entries share label names and
/// help text; values are pulled at gather time.
struct Family {
    label_names: Vec<String>,
    gauge: GaugeVec,
    fixed: HashMap<MeterId, FixedEntry>,
    dynamic: Option<DynamicSupplier>,
}

/// The set of all supplier-backed families, registered with the prometheus
/// registry as a single custom collector. Registration is one-shot per
/// meter identity; the read path only walks suppliers.
pub struct SupplierFamilies {
    desc: Desc,
    families: RwLock<HashMap<String, Family>>,
}

impl SupplierFamilies {
    pub fn new() -> Result<Self> {
        let desc = Desc::new(
            "greengage_exporter_supplier_meters".to_string(),
            "Number of supplier-backed meters currently registered".to_string(),
            vec![],
            HashMap::new(),
        )?;
        Ok(Self {
            desc,
            families: RwLock::new(HashMap::new()),
        })
    }

    /// Register a gauge read from `supplier`. Labels must arrive in a
    /// consistent order for a given metric name. Registering the same
    /// identity twice is an error.
    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        supplier: GaugeSupplier,
    ) -> Result<MeterId> {
        let id = MeterId::new(name, labels);
        let label_names: Vec<String> = labels.iter().map(|(k, _)| (*k).to_string()).collect();
        let label_values: Vec<String> = labels.iter().map(|(_, v)| (*v).to_string()).collect();

        let mut families = self.write();
        let family = match families.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let gauge = new_family_gauge(name, help, &label_names)?;
                entry.insert(Family {
                    label_names: label_names.clone(),
                    gauge,
                    fixed: HashMap::new(),
                    dynamic: None,
                })
            }
        };

        if family.dynamic.is_some() {
            return Err(anyhow!("metric family '{name}' has dynamic labels"));
        }
        if family.label_names != label_names {
            return Err(anyhow!(
                "metric family '{name}' registered with labels {:?}, got {:?}",
                family.label_names,
                label_names
            ));
        }
        if family.fixed.contains_key(&id) {
            return Err(anyhow!("meter already registered: {id:?}"));
        }
        family.fixed.insert(
            id.clone(),
            FixedEntry {
                label_values,
                supplier,
            },
        );
        Ok(id)
    }

    /// Register a gauge whose label values are computed at gather time.
    /// The family is exclusive: no fixed-label meters may share its name.
    pub fn register_dynamic_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        supplier: DynamicSupplier,
    ) -> Result<MeterId> {
        let names: Vec<String> = label_names.iter().map(|s| (*s).to_string()).collect();
        let mut families = self.write();
        if families.contains_key(name) {
            return Err(anyhow!("metric family '{name}' already registered"));
        }
        let gauge = new_family_gauge(name, help, &names)?;
        families.insert(
            name.to_string(),
            Family {
                label_names: names,
                gauge,
                fixed: HashMap::new(),
                dynamic: Some(supplier),
            },
        );
        Ok(MeterId::new(name, &[]))
    }

    /// Remove a previously registered meter, dropping its time series from
    /// the exposition.
    pub fn remove(&self, id: &MeterId) -> Result<()> {
        let mut families = self.write();
        let family = families
            .get_mut(id.name())
            .ok_or_else(|| anyhow!("no such metric family: {}", id.name()))?;

        if family.dynamic.is_some() {
            family.gauge.reset();
            families.remove(id.name());
            return Ok(());
        }

        let entry = family
            .fixed
            .remove(id)
            .ok_or_else(|| anyhow!("no such meter: {id:?}"))?;
        let refs: Vec<&str> = entry.label_values.iter().map(String::as_str).collect();
        family.gauge.remove_label_values(&refs)?;
        Ok(())
    }

    pub fn contains(&self, id: &MeterId) -> bool {
        self.read()
            .get(id.name())
            .is_some_and(|f| f.fixed.contains_key(id))
    }

    pub fn meter_count(&self) -> usize {
        self.read()
            .values()
            .map(|f| f.fixed.len() + usize::from(f.dynamic.is_some()))
            .sum()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Family>> {
        self.families.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Family>> {
        self.families
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_family_gauge(name: &str, help: &str, label_names: &[String]) -> Result<GaugeVec> {
    let refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
    Ok(GaugeVec::new(Opts::new(name, help), &refs)?)
}

/// Registry-facing handle; the registry owns a boxed clone while the
/// adapter keeps the original for registration and removal.
#[derive(Clone)]
pub struct SupplierFamiliesHandle(pub Arc<SupplierFamilies>);

impl Collector for SupplierFamiliesHandle {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.0.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let families = self.0.read();
        let mut out = Vec::with_capacity(families.len() + 1);

        for family in families.values() {
            if let Some(dynamic) = &family.dynamic {
                family.gauge.reset();
                let (values, value) = dynamic();
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                if let Ok(child) = family.gauge.get_metric_with_label_values(&refs) {
                    child.set(value);
                }
            } else {
                for entry in family.fixed.values() {
                    let refs: Vec<&str> = entry.label_values.iter().map(String::as_str).collect();
                    if let Ok(child) = family.gauge.get_metric_with_label_values(&refs) {
                        child.set((entry.supplier)());
                    }
                }
            }
            out.extend(family.gauge.collect());
        }

        let meter_count = prometheus::Gauge::with_opts(Opts::new(
            self.0.desc.fq_name.clone(),
            self.0.desc.help.clone(),
        ))
        .expect("valid meter-count gauge");
        meter_count.set(self.0.meter_count() as f64);
        out.extend(meter_count.collect());

        out
    }
}
