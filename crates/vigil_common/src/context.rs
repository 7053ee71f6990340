//! Context Classifier - what is the user doing right now?
//!
//! Running process names are looked up in a static table built from the
//! configured membership sets. The strongest category present wins:
//! Gaming > Creative > Work > Idle. The classifier only describes the
//! resource policy that fits; applying it is someone else's job.

use crate::config::ContextConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Ordered by priority: a later variant beats an earlier one
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageContext {
    Idle,
    Work,
    Creative,
    Gaming,
}

impl fmt::Display for UsageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UsageContext::Idle => "idle",
            UsageContext::Work => "work",
            UsageContext::Creative => "creative",
            UsageContext::Gaming => "gaming",
        };
        write!(f, "{}", s)
    }
}

/// Scheduling hint for the foreground workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityHint {
    High,
    AboveNormal,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerProfile {
    Performance,
    Balanced,
    PowerSaver,
}

/// Declarative description of how resources should be managed in a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub context: UsageContext,
    pub priority_hint: PriorityHint,
    /// Cleanup, indexing and similar housekeeping may run
    pub background_maintenance_allowed: bool,
    pub pause_updates: bool,
    pub power_profile: PowerProfile,
    pub suggestions: Vec<String>,
}

/// Lowercase, trimmed, without a trailing `.exe`
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

pub struct ContextClassifier {
    table: HashMap<String, UsageContext>,
}

impl ContextClassifier {
    pub fn from_config(config: &ContextConfig) -> Self {
        let mut table = HashMap::new();
        let sets = [
            (UsageContext::Work, &config.work),
            (UsageContext::Creative, &config.creative),
            (UsageContext::Gaming, &config.games),
        ];
        for (context, names) in sets {
            for name in names {
                // Validated config never lists a name twice; keep the stronger one if it does
                let entry = table.entry(normalize_process_name(name)).or_insert(context);
                *entry = (*entry).max(context);
            }
        }
        Self { table }
    }

    pub fn lookup(&self, process_name: &str) -> Option<UsageContext> {
        self.table.get(&normalize_process_name(process_name)).copied()
    }

    /// Strongest context among the running processes, `Idle` if none match
    pub fn classify<S: AsRef<str>>(&self, process_names: &[S]) -> UsageContext {
        let mut best = UsageContext::Idle;
        for name in process_names {
            if let Some(context) = self.lookup(name.as_ref()) {
                if context > best {
                    debug!("Process {} -> {}", name.as_ref(), context);
                    best = context;
                }
                if best == UsageContext::Gaming {
                    break;
                }
            }
        }
        best
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Static policy for a context
pub fn resolve_policy(context: UsageContext) -> ResourcePolicy {
    match context {
        UsageContext::Gaming => ResourcePolicy {
            context,
            priority_hint: PriorityHint::High,
            background_maintenance_allowed: false,
            pause_updates: true,
            power_profile: PowerProfile::Performance,
            suggestions: to_strings(&[
                "Close unnecessary background applications",
                "Enable the high-performance power profile",
                "Postpone system updates until the session ends",
                "Close browser tabs to free RAM",
            ]),
        },
        UsageContext::Creative => ResourcePolicy {
            context,
            priority_hint: PriorityHint::AboveNormal,
            background_maintenance_allowed: false,
            pause_updates: true,
            power_profile: PowerProfile::Balanced,
            suggestions: to_strings(&[
                "Close unused browser tabs",
                "Leave more RAM for creative applications",
                "Clear stale application caches",
                "Disable non-essential startup programs",
            ]),
        },
        UsageContext::Work => ResourcePolicy {
            context,
            priority_hint: PriorityHint::Normal,
            background_maintenance_allowed: true,
            pause_updates: false,
            power_profile: PowerProfile::Balanced,
            suggestions: to_strings(&[
                "Organize browser tabs to reduce memory usage",
                "Close unused applications",
                "Clear browser cache for faster performance",
            ]),
        },
        UsageContext::Idle => ResourcePolicy {
            context,
            priority_hint: PriorityHint::Normal,
            background_maintenance_allowed: true,
            pause_updates: false,
            power_profile: PowerProfile::PowerSaver,
            suggestions: to_strings(&[
                "Good time to run a deep system cleanup",
                "Schedule automatic optimization",
                "Update applications and system",
            ]),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ContextClassifier {
        ContextClassifier::from_config(&ContextConfig::default())
    }

    #[test]
    fn test_game_beats_browser() {
        let c = classifier();
        assert_eq!(c.classify(&["chrome", "steam", "bash"]), UsageContext::Gaming);
        assert_eq!(c.classify(&["Chrome.exe", "CSGO.exe"]), UsageContext::Gaming);
    }

    #[test]
    fn test_priority_order() {
        let c = classifier();
        assert_eq!(c.classify(&["firefox", "blender"]), UsageContext::Creative);
        assert_eq!(c.classify(&["code", "systemd"]), UsageContext::Work);
        assert_eq!(c.classify(&["systemd", "sshd"]), UsageContext::Idle);
        assert_eq!(c.classify::<&str>(&[]), UsageContext::Idle);
    }

    #[test]
    fn test_order_of_processes_does_not_matter() {
        let c = classifier();
        let forward = ["slack", "gimp", "minecraft"];
        let mut backward = forward;
        backward.reverse();
        assert_eq!(c.classify(&forward), c.classify(&backward));
    }

    #[test]
    fn test_config_names_are_normalized() {
        let config = ContextConfig {
            games: vec![" MyGame.EXE ".into()],
            creative: vec![],
            work: vec![],
        };
        let c = ContextClassifier::from_config(&config);
        assert_eq!(c.lookup("mygame"), Some(UsageContext::Gaming));
        assert_eq!(c.lookup("chrome"), None);
    }

    #[test]
    fn test_policies() {
        let gaming = resolve_policy(UsageContext::Gaming);
        assert!(gaming.pause_updates);
        assert!(!gaming.background_maintenance_allowed);
        assert_eq!(gaming.power_profile, PowerProfile::Performance);

        let idle = resolve_policy(UsageContext::Idle);
        assert!(idle.background_maintenance_allowed);
        assert!(!idle.suggestions.is_empty());
    }
}
