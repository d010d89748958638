//! Reference-count balance checking across a run.

use super::{SimResult, SimRuntime};
use std::collections::BTreeMap;
use std::fmt;

/// Reference counts of every live object at one point in time.
#[derive(Debug, Clone)]
pub struct RefSnapshot {
    counts: BTreeMap<u64, i64>,
    ref_total: i64,
    check_total: bool,
}

impl RefSnapshot {
    pub fn live_objects(&self) -> usize {
        self.counts.len()
    }
}

/// Differences between a snapshot and the current object graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// Objects created since the snapshot that are still alive.
    pub leaked: Vec<(u64, String)>,
    /// Objects alive at the snapshot that have since been freed.
    pub freed: Vec<(u64, String)>,
    /// `(object, before, after)` for surviving objects whose count moved.
    pub changed: Vec<(u64, i64, i64)>,
    /// `_Py_RefTotal` before and after, when reference debugging is on and it moved.
    pub ref_total: Option<(i64, i64)>,
}

impl BalanceReport {
    pub fn is_balanced(&self) -> bool {
        self.leaked.is_empty() && self.freed.is_empty() && self.changed.is_empty() && self.ref_total.is_none()
    }
}

impl fmt::Display for BalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_balanced() {
            return f.write_str("reference counts balanced");
        }
        writeln!(f, "reference counts unbalanced:")?;
        for (addr, repr) in &self.leaked {
            writeln!(f, "  leaked {:#x}: {}", addr, repr)?;
        }
        for (addr, repr) in &self.freed {
            writeln!(f, "  freed {:#x}: {}", addr, repr)?;
        }
        for (addr, before, after) in &self.changed {
            writeln!(f, "  {:#x}: {} -> {}", addr, before, after)?;
        }
        if let Some((before, after)) = self.ref_total {
            writeln!(f, "  _Py_RefTotal: {} -> {}", before, after)?;
        }
        Ok(())
    }
}

impl SimRuntime {
    pub fn snapshot(&self) -> SimResult<RefSnapshot> {
        let mut counts = BTreeMap::new();
        for (&addr, record) in &self.objects {
            if record.alive {
                counts.insert(addr, self.refcount(addr)?);
            }
        }
        Ok(RefSnapshot {
            counts,
            ref_total: self.ref_total()?,
            check_total: self.ref_debug,
        })
    }

    /// Compare the current object graph against `before`.
    pub fn balance_since(&self, before: &RefSnapshot) -> SimResult<BalanceReport> {
        let mut report = BalanceReport::default();
        for (&addr, record) in &self.objects {
            if !record.alive {
                continue;
            }
            let now = self.refcount(addr)?;
            match before.counts.get(&addr) {
                None => report.leaked.push((addr, self.repr(addr)?)),
                Some(&was) if was != now => report.changed.push((addr, was, now)),
                Some(_) => {}
            }
        }
        for &addr in before.counts.keys() {
            if !self.is_alive(addr) {
                let type_name = self
                    .objects
                    .get(&addr)
                    .map_or("?", |record| record.payload.type_name());
                report.freed.push((addr, format!("<{}>", type_name)));
            }
        }
        let total = self.ref_total()?;
        if before.check_total && total != before.ref_total {
            report.ref_total = Some((before.ref_total, total));
        }
        if !report.is_balanced() {
            log::debug!("sim: {}", report);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::TranslatorConfig;
    use crate::sim::SimRuntime;

    #[test]
    fn test_balance_detects_leak_and_total() {
        let mut sim = SimRuntime::new(&TranslatorConfig::default().with_ref_debug(true)).unwrap();
        let before = sim.snapshot().unwrap();
        assert!(sim.balance_since(&before).unwrap().is_balanced());

        let leaked = sim.new_int(3).unwrap();
        let report = sim.balance_since(&before).unwrap();
        assert_eq!(report.leaked, vec![(leaked, "3".to_string())]);
        assert_eq!(report.ref_total, Some((before_total(&before), before_total(&before) + 1)));
        assert!(report.to_string().contains("leaked"));

        sim.release(leaked).unwrap();
        assert!(sim.balance_since(&before).unwrap().is_balanced());
    }

    #[test]
    fn test_changed_count_reported() {
        let mut sim = SimRuntime::new(&TranslatorConfig::default()).unwrap();
        let none = sim.none();
        let before = sim.snapshot().unwrap();
        sim.incref(none).unwrap();
        let report = sim.balance_since(&before).unwrap();
        assert_eq!(report.changed.len(), 1);
        // Without reference debugging the total is not compared.
        assert_eq!(report.ref_total, None);
    }

    fn before_total(snapshot: &super::RefSnapshot) -> i64 {
        snapshot.ref_total
    }
}
