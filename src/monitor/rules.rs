//! Alert rules evaluated by the alert loop.

use std::time::Duration;

use serde::Serialize;

use super::{ComponentHealth, SystemMetricsSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// What a rule looks at and the threshold it applies.
#[derive(Debug, Clone, Copy)]
pub enum RuleKind {
    /// System rule over the latest metrics sample.
    MemoryAbove(f64),
    CpuAbove(f64),
    DiskAbove(f64),
    /// Component rule over each registered component.
    ComponentErrorsAbove(u64),
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: &'static str,
    pub kind: RuleKind,
    pub severity: AlertSeverity,
    /// A cleared alert may not re-fire within this window.
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn is_system(&self) -> bool {
        !matches!(self.kind, RuleKind::ComponentErrorsAbove(_))
    }

    /// Message when the rule fires against a metrics sample.
    pub fn evaluate_system(&self, m: &SystemMetricsSample) -> Option<String> {
        match self.kind {
            RuleKind::MemoryAbove(pct) if m.memory_percent > pct => Some(format!(
                "memory usage {:.1}% above {:.0}%",
                m.memory_percent, pct
            )),
            RuleKind::CpuAbove(pct) if m.cpu_percent > pct => {
                Some(format!("cpu usage {:.1}% above {:.0}%", m.cpu_percent, pct))
            }
            RuleKind::DiskAbove(pct) if m.disk_usage_percent > pct => Some(format!(
                "disk usage {:.1}% above {:.0}%",
                m.disk_usage_percent, pct
            )),
            _ => None,
        }
    }

    /// Message when the rule fires against a component.
    pub fn evaluate_component(&self, c: &ComponentHealth) -> Option<String> {
        match self.kind {
            RuleKind::ComponentErrorsAbove(n) if c.error_count > n => Some(format!(
                "component {} has {} errors",
                c.name, c.error_count
            )),
            _ => None,
        }
    }
}

/// The built-in rule table.
pub fn builtin_rules() -> Vec<AlertRule> {
    let cooldown = Duration::from_secs(300);
    vec![
        AlertRule {
            name: "high_memory_usage",
            kind: RuleKind::MemoryAbove(85.0),
            severity: AlertSeverity::Warning,
            cooldown,
        },
        AlertRule {
            name: "critical_memory_usage",
            kind: RuleKind::MemoryAbove(95.0),
            severity: AlertSeverity::Critical,
            cooldown,
        },
        AlertRule {
            name: "high_cpu_usage",
            kind: RuleKind::CpuAbove(80.0),
            severity: AlertSeverity::Warning,
            cooldown,
        },
        AlertRule {
            name: "disk_space_low",
            kind: RuleKind::DiskAbove(90.0),
            severity: AlertSeverity::Critical,
            cooldown,
        },
        AlertRule {
            name: "high_error_rate",
            kind: RuleKind::ComponentErrorsAbove(10),
            severity: AlertSeverity::Warning,
            cooldown,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(memory: f64, cpu: f64, disk: f64) -> SystemMetricsSample {
        SystemMetricsSample {
            timestamp: Utc::now(),
            total_memory_mb: 16_000.0,
            used_memory_mb: 0.0,
            memory_percent: memory,
            cpu_percent: cpu,
            disk_usage_percent: disk,
            active_connections: 0,
            kv_connections: 0,
            sql_connections: 0,
        }
    }

    #[test]
    fn memory_rules_trigger_on_thresholds() {
        let rules = builtin_rules();
        let warning = rules.iter().find(|r| r.name == "high_memory_usage").unwrap();
        let critical = rules
            .iter()
            .find(|r| r.name == "critical_memory_usage")
            .unwrap();

        let calm = sample(50.0, 10.0, 10.0);
        assert!(warning.evaluate_system(&calm).is_none());

        let hot = sample(96.0, 10.0, 10.0);
        assert!(warning.evaluate_system(&hot).is_some());
        assert!(critical.evaluate_system(&hot).is_some());

        let elevated = sample(90.0, 10.0, 10.0);
        assert!(warning.evaluate_system(&elevated).is_some());
        assert!(critical.evaluate_system(&elevated).is_none());
    }

    #[test]
    fn component_error_rule_counts_errors() {
        let rule = builtin_rules()
            .into_iter()
            .find(|r| r.name == "high_error_rate")
            .unwrap();
        assert!(!rule.is_system());

        let mut component = ComponentHealth::new("eng", None);
        assert!(rule.evaluate_component(&component).is_none());
        component.error_count = 11;
        assert!(rule.evaluate_component(&component).is_some());
    }
}
