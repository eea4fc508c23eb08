//! Selector resolution: turns `vm-export`, `vdi-export` and `exclude`
//! entries into one ordered, deduplicated list of [`BackupTarget`]s.
//!
//! Each entry is either a literal VM name or a regular expression,
//! optionally followed by `:<max_backups>`. Resolution rules:
//!
//! - Within a list, the last entry matching a VM decides its retention
//!   override, while the VM keeps the position where it was first seen.
//! - `exclude` always wins over both include lists.
//! - `vdi-export` wins over `vm-export`.
//!
//! Nothing here touches global state; warnings and fatal errors are
//! collected in a [`ResolutionContext`] and returned with the targets.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Characters that make a pattern a plain VM name rather than a regex.
static LITERAL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\w\s\-_]+$").expect("literal VM name pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExportKind {
    #[serde(rename = "vm-export")]
    VmExport,
    #[serde(rename = "vdi-export")]
    VdiExport,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::VmExport => "vm-export",
            ExportKind::VdiExport => "vdi-export",
        }
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `pattern[:max_backups]` line from a selector list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorEntry {
    pub pattern: String,
    pub backup_override: Option<u32>,
}

impl SelectorEntry {
    /// Split `raw` at the first `:`. Anything after it must be a positive integer.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (pattern, override_part) = match raw.split_once(':') {
            Some((pattern, rest)) => (pattern, Some(rest.trim())),
            None => (raw, None),
        };

        let backup_override = match override_part {
            None => None,
            Some(text) => match text.parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(format!(
                        "max_backups override '{}' is not a positive integer",
                        text
                    ))
                }
            },
        };

        Ok(Self {
            pattern: pattern.trim().to_string(),
            backup_override,
        })
    }

    pub fn is_literal(&self) -> bool {
        LITERAL_NAME.is_match(&self.pattern)
    }
}

/// A VM chosen for backup, with its resolved retention count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupTarget {
    pub vm_name: String,
    pub export_kind: ExportKind,
    pub max_backups: u32,
}

/// How an empty `vm-export=` entry is interpreted.
///
/// `vdi-export=` and `exclude=` with an empty pattern are always dropped;
/// an empty exclude would otherwise exclude every VM on the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EmptyPatternPolicy {
    #[default]
    #[value(name = "nothing")]
    MatchNothing,
    #[value(name = "all")]
    MatchAll,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub default_max_backups: u32,
    pub empty_vm_export: EmptyPatternPolicy,
}

#[derive(Debug)]
enum Matcher {
    Any,
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    fn compile(entry: &SelectorEntry) -> Result<Self, regex::Error> {
        if entry.is_literal() {
            return Ok(Matcher::Literal(entry.pattern.clone()));
        }
        Regex::new(&format!("^(?:{})$", entry.pattern)).map(Matcher::Pattern)
    }

    fn matches(&self, vm: &str) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Literal(name) => name == vm,
            Matcher::Pattern(re) => re.is_match(vm),
        }
    }
}

/// Inventory plus the diagnostics gathered while resolving against it.
#[derive(Debug)]
pub struct ResolutionContext<'a> {
    inventory: &'a [String],
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl<'a> ResolutionContext<'a> {
    pub fn new(inventory: &'a [String]) -> Self {
        Self {
            inventory,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn matching_vms(&self, matcher: &Matcher) -> Vec<&'a String> {
        self.inventory
            .iter()
            .filter(|vm| matcher.matches(vm))
            .collect()
    }

    /// Every inventory VM matched by some exclude entry.
    pub fn expand_excludes(&mut self, entries: &[String]) -> IndexSet<String> {
        let mut excluded = IndexSet::new();

        for raw in entries {
            let (pattern, rest) = match raw.split_once(':') {
                Some((pattern, rest)) => (pattern.trim(), Some(rest)),
                None => (raw.trim(), None),
            };
            if pattern.is_empty() {
                continue;
            }
            if rest.is_some() {
                self.warn(format!(
                    "max_backups override ignored on exclude entry: exclude={}",
                    raw
                ));
            }

            let entry = SelectorEntry {
                pattern: pattern.to_string(),
                backup_override: None,
            };
            let matcher = match Matcher::compile(&entry) {
                Ok(matcher) => matcher,
                Err(e) => {
                    self.error(format!("invalid regex: exclude={} ({})", raw, e));
                    continue;
                }
            };

            let matches = self.matching_vms(&matcher);
            if matches.is_empty() {
                self.warn(format!("vm not found: exclude={}", raw));
                continue;
            }
            excluded.extend(matches.into_iter().cloned());
        }

        excluded
    }

    /// Resolve one include list into `vm name -> override`, in first-seen order.
    pub fn resolve_list(
        &mut self,
        kind: ExportKind,
        entries: &[String],
        excluded: &IndexSet<String>,
        policy: EmptyPatternPolicy,
    ) -> IndexMap<String, Option<u32>> {
        let mut resolved: IndexMap<String, Option<u32>> = IndexMap::new();

        for raw in entries {
            let entry = match SelectorEntry::parse(raw) {
                Ok(entry) => entry,
                Err(reason) => {
                    self.error(format!("invalid entry {}={}: {}", kind, raw, reason));
                    continue;
                }
            };

            let matcher = if entry.pattern.is_empty() {
                match (kind, policy) {
                    (ExportKind::VmExport, EmptyPatternPolicy::MatchAll) => Matcher::Any,
                    (ExportKind::VmExport, EmptyPatternPolicy::MatchNothing) => {
                        self.warn(format!("empty pattern ignored: {}={}", kind, raw));
                        continue;
                    }
                    (ExportKind::VdiExport, _) => continue,
                }
            } else {
                match Matcher::compile(&entry) {
                    Ok(matcher) => matcher,
                    Err(e) => {
                        self.error(format!("invalid regex: {}={} ({})", kind, raw, e));
                        continue;
                    }
                }
            };

            let matches = self.matching_vms(&matcher);
            if matches.is_empty() {
                self.warn(format!("vm not found: {}={}", kind, raw));
                continue;
            }

            // Last write wins; `insert` keeps the original position of an existing key.
            for vm in matches {
                debug!("{} entry '{}' selects {}", kind, raw, vm);
                resolved.insert(vm.clone(), entry.backup_override);
            }
        }

        let mut forced = Vec::new();
        resolved.retain(|vm, _| {
            let keep = !excluded.contains(vm);
            if !keep {
                forced.push(vm.clone());
            }
            keep
        });
        for vm in forced {
            self.warn(format!("forcing exclude of: {} ({})", vm, kind));
        }

        resolved
    }
}

/// Output of [`resolve`]: targets in backup order plus diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub targets: Vec<BackupTarget>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Resolution {
    pub fn is_fatal(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn targets_of(&self, kind: ExportKind) -> impl Iterator<Item = &BackupTarget> {
        self.targets.iter().filter(move |t| t.export_kind == kind)
    }
}

/// Resolve the three selector lists against the pool inventory.
///
/// `vdi-export` targets come first, then `vm-export` targets; within each
/// kind the order is the order VMs were first matched.
pub fn resolve(
    vm_export: &[String],
    vdi_export: &[String],
    exclude: &[String],
    inventory: &[String],
    options: &ResolveOptions,
) -> Resolution {
    let mut ctx = ResolutionContext::new(inventory);

    let excluded = ctx.expand_excludes(exclude);
    let vdi = ctx.resolve_list(
        ExportKind::VdiExport,
        vdi_export,
        &excluded,
        options.empty_vm_export,
    );
    let mut vm = ctx.resolve_list(
        ExportKind::VmExport,
        vm_export,
        &excluded,
        options.empty_vm_export,
    );

    let shadowed: Vec<String> = vm
        .keys()
        .filter(|name| vdi.contains_key(*name))
        .cloned()
        .collect();
    for name in shadowed {
        vm.shift_remove(&name);
        ctx.warn(format!(
            "vdi-export duplicate - removing vm-export={}",
            name
        ));
    }

    let to_target = |kind: ExportKind| {
        move |(vm_name, backup_override): (String, Option<u32>)| BackupTarget {
            vm_name,
            export_kind: kind,
            max_backups: backup_override
                .filter(|n| *n > 0)
                .unwrap_or(options.default_max_backups),
        }
    };

    let targets = vdi
        .into_iter()
        .map(to_target(ExportKind::VdiExport))
        .chain(vm.into_iter().map(to_target(ExportKind::VmExport)))
        .collect();

    Resolution {
        targets,
        warnings: ctx.warnings,
        errors: ctx.errors,
    }
}

/// Names of targets that are not in `inventory`.
pub fn verify_targets(targets: &[BackupTarget], inventory: &[String]) -> Vec<String> {
    targets
        .iter()
        .filter(|t| !inventory.contains(&t.vm_name))
        .map(|t| t.vm_name.clone())
        .collect()
}

/// Inventory VMs that no target covers.
pub fn vms_not_in_backup(targets: &[BackupTarget], inventory: &[String]) -> Vec<String> {
    inventory
        .iter()
        .filter(|vm| !targets.iter().any(|t| &t.vm_name == *vm))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn entries(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn options() -> ResolveOptions {
        ResolveOptions {
            default_max_backups: 4,
            empty_vm_export: EmptyPatternPolicy::MatchNothing,
        }
    }

    fn names(resolution: &Resolution) -> Vec<&str> {
        resolution
            .targets
            .iter()
            .map(|t| t.vm_name.as_str())
            .collect()
    }

    #[test]
    fn test_parse_entry_with_override() {
        let entry = SelectorEntry::parse("PRD-web:3").unwrap();
        assert_eq!(entry.pattern, "PRD-web");
        assert_eq!(entry.backup_override, Some(3));
        assert!(entry.is_literal());
    }

    #[test]
    fn test_parse_entry_rejects_bad_override() {
        assert!(SelectorEntry::parse("PRD-web:0").is_err());
        assert!(SelectorEntry::parse("PRD-web:abc").is_err());
        assert!(SelectorEntry::parse("PRD-web:").is_err());
        assert!(SelectorEntry::parse("PRD-web:1:2").is_err());
    }

    #[test]
    fn test_literal_classification() {
        assert!(SelectorEntry::parse("my vm_01").unwrap().is_literal());
        assert!(!SelectorEntry::parse("PRD-.*").unwrap().is_literal());
    }

    #[test]
    fn test_literal_with_override() {
        let inv = inventory(&["PRD-web"]);
        let resolution = resolve(&entries(&["PRD-web:3"]), &[], &[], &inv, &options());

        assert_eq!(
            resolution.targets,
            vec![BackupTarget {
                vm_name: "PRD-web".to_string(),
                export_kind: ExportKind::VmExport,
                max_backups: 3,
            }]
        );
        assert!(resolution.warnings.is_empty());
        assert!(!resolution.is_fatal());
    }

    #[test]
    fn test_exclude_wins_over_regex_include() {
        let inv = inventory(&["PRD-web", "PRD-db"]);
        let resolution = resolve(
            &entries(&["PRD-.*"]),
            &[],
            &entries(&["PRD-web"]),
            &inv,
            &options(),
        );

        assert_eq!(names(&resolution), vec!["PRD-db"]);
        assert!(resolution
            .warnings
            .iter()
            .any(|w| w.contains("forcing exclude of: PRD-web")));
    }

    #[test]
    fn test_exclude_wins_over_later_override() {
        let inv = inventory(&["PRD-web", "PRD-db"]);
        let resolution = resolve(
            &entries(&["PRD-.*", "PRD-web:7"]),
            &[],
            &entries(&["PRD-w.*"]),
            &inv,
            &options(),
        );
        assert_eq!(names(&resolution), vec!["PRD-db"]);
    }

    #[test]
    fn test_vdi_export_takes_precedence() {
        let inv = inventory(&["PRD-web", "PRD-db", "DEV-app"]);
        let resolution = resolve(
            &entries(&["PRD-.*", "DEV-app"]),
            &entries(&["PRD-db:2"]),
            &[],
            &inv,
            &options(),
        );

        let db: Vec<_> = resolution
            .targets
            .iter()
            .filter(|t| t.vm_name == "PRD-db")
            .collect();
        assert_eq!(db.len(), 1);
        assert_eq!(db[0].export_kind, ExportKind::VdiExport);
        assert_eq!(db[0].max_backups, 2);
        assert_eq!(names(&resolution), vec!["PRD-db", "PRD-web", "DEV-app"]);
        assert!(resolution
            .warnings
            .iter()
            .any(|w| w.contains("vdi-export duplicate - removing vm-export=PRD-db")));
    }

    #[test]
    fn test_last_write_wins_keeps_first_position() {
        let inv = inventory(&["PRD-web", "PRD-db"]);
        let resolution = resolve(
            &entries(&["PRD-.*", "PRD-web:9"]),
            &[],
            &[],
            &inv,
            &options(),
        );

        assert_eq!(names(&resolution), vec!["PRD-web", "PRD-db"]);
        assert_eq!(resolution.targets[0].max_backups, 9);
        assert_eq!(resolution.targets[1].max_backups, 4);
    }

    #[test]
    fn test_later_plain_entry_replaces_override() {
        let inv = inventory(&["PRD-web"]);
        let resolution = resolve(
            &entries(&["PRD-web:9", "PRD-web"]),
            &[],
            &[],
            &inv,
            &options(),
        );
        assert_eq!(resolution.targets.len(), 1);
        assert_eq!(resolution.targets[0].max_backups, 4);
    }

    #[test]
    fn test_regex_must_match_whole_name() {
        let inv = inventory(&["PRD-web", "OLD-PRD-web"]);
        let resolution = resolve(&entries(&["PRD-.*"]), &[], &[], &inv, &options());
        assert_eq!(names(&resolution), vec!["PRD-web"]);
    }

    #[test]
    fn test_unmatched_entry_is_warning() {
        let inv = inventory(&["PRD-web"]);
        let resolution = resolve(
            &entries(&["PRD-web", "ghost"]),
            &[],
            &entries(&["phantom"]),
            &inv,
            &options(),
        );
        assert_eq!(names(&resolution), vec!["PRD-web"]);
        assert!(!resolution.is_fatal());
        assert!(resolution
            .warnings
            .contains(&"vm not found: vm-export=ghost".to_string()));
        assert!(resolution
            .warnings
            .contains(&"vm not found: exclude=phantom".to_string()));
    }

    #[test]
    fn test_invalid_regex_is_fatal() {
        let inv = inventory(&["PRD-web"]);
        let resolution = resolve(
            &entries(&["PRD-[", "PRD-web"]),
            &[],
            &[],
            &inv,
            &options(),
        );
        assert!(resolution.is_fatal());
        assert!(resolution.errors[0].contains("invalid regex: vm-export=PRD-["));
        assert_eq!(names(&resolution), vec!["PRD-web"]);
    }

    #[test]
    fn test_invalid_override_is_fatal() {
        let inv = inventory(&["PRD-web"]);
        let resolution = resolve(&[], &entries(&["PRD-web:zero"]), &[], &inv, &options());
        assert!(resolution.is_fatal());
        assert!(resolution.targets.is_empty());
    }

    #[test]
    fn test_empty_patterns_select_nothing_by_default() {
        let inv = inventory(&["PRD-web", "PRD-db"]);
        let resolution = resolve(
            &entries(&["", "PRD-db"]),
            &entries(&[""]),
            &entries(&[""]),
            &inv,
            &options(),
        );
        assert_eq!(names(&resolution), vec!["PRD-db"]);
        assert_eq!(resolution.warnings, vec!["empty pattern ignored: vm-export=".to_string()]);
    }

    #[test]
    fn test_empty_vm_export_can_match_all() {
        let inv = inventory(&["PRD-web", "PRD-db"]);
        let opts = ResolveOptions {
            empty_vm_export: EmptyPatternPolicy::MatchAll,
            ..options()
        };
        let resolution = resolve(
            &entries(&[""]),
            &entries(&[""]),
            &entries(&["PRD-db"]),
            &inv,
            &opts,
        );
        assert_eq!(names(&resolution), vec!["PRD-web"]);
    }

    #[test]
    fn test_override_on_exclude_is_ignored_with_warning() {
        let inv = inventory(&["PRD-web", "PRD-db"]);
        let resolution = resolve(
            &entries(&["PRD-.*"]),
            &[],
            &entries(&["PRD-db:3"]),
            &inv,
            &options(),
        );
        assert_eq!(names(&resolution), vec!["PRD-web"]);
        assert!(resolution
            .warnings
            .iter()
            .any(|w| w.starts_with("max_backups override ignored")));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let inv = inventory(&["a1", "a2", "b1", "b2", "c1"]);
        let vm = entries(&["a.*", "b1:2", "c1"]);
        let vdi = entries(&["b.*", "a2:5"]);
        let exclude = entries(&["c1"]);

        let first = resolve(&vm, &vdi, &exclude, &inv, &options());
        let second = resolve(&vm, &vdi, &exclude, &inv, &options());
        assert_eq!(first, second);
        assert_eq!(names(&first), vec!["b1", "b2", "a2", "a1"]);
    }

    #[test]
    fn test_targets_are_unique_by_name() {
        let inv = inventory(&["a1", "a2", "b1"]);
        let resolution = resolve(
            &entries(&["a.*", "a1", ".*1", "a2:3"]),
            &entries(&["b1", "b.*"]),
            &[],
            &inv,
            &options(),
        );
        let mut seen = std::collections::HashSet::new();
        for target in &resolution.targets {
            assert!(seen.insert(target.vm_name.clone()));
        }
    }

    #[test]
    fn test_verify_targets_reports_missing() {
        let targets = vec![
            BackupTarget {
                vm_name: "PRD-web".to_string(),
                export_kind: ExportKind::VmExport,
                max_backups: 4,
            },
            BackupTarget {
                vm_name: "gone".to_string(),
                export_kind: ExportKind::VdiExport,
                max_backups: 4,
            },
        ];
        let inv = inventory(&["PRD-web"]);
        assert_eq!(verify_targets(&targets, &inv), vec!["gone".to_string()]);
        assert!(vms_not_in_backup(&targets, &inv).is_empty());
    }
}
