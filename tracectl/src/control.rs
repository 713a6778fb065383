// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing runtime control.

use ordermap::OrderMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
#[allow(unused)]
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, filter::LevelFilter, prelude::*, reload};

use crate::display::TargetTableByTag;
use crate::targets::{DeclaredTarget, TRACING_TARGETS, TargetKind};
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &["infra"]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceCtlError {
    #[error("Invalid level '{0}' for tag '{1}'")]
    BadLevel(String, String),
    #[error("Invalid syntax '{0}': expected tag=level")]
    BadSyntax(String),
    #[error("Unknown tag '{0}'")]
    UnknownTag(String),
}

#[derive(Debug, Clone)]
pub(crate) struct TargetEntry {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: Vec<&'static str>,
    pub(crate) kind: TargetKind,
}
impl TargetEntry {
    fn new(declared: &DeclaredTarget) -> Self {
        // a target can always be addressed by its own name
        let mut tags = declared.tags.to_vec();
        if !tags.contains(&declared.name) {
            tags.push(declared.name);
        }
        Self {
            target: declared.target,
            name: declared.name,
            level: declared.level,
            tags,
            kind: declared.kind,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TagEntry {
    pub(crate) tag: &'static str,
    pub(crate) targets: HashSet<&'static str>,
}
impl TagEntry {
    fn new(tag: &'static str, target: &'static str) -> Self {
        let mut targets = HashSet::with_capacity(1);
        targets.insert(target);
        Self { tag, targets }
    }
}

#[derive(Debug)]
pub(crate) struct TargetTable {
    pub(crate) level: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetEntry>,
    pub(crate) tags: OrderMap<&'static str, TagEntry>,
}

impl TargetTable {
    fn new(level: LevelFilter) -> Self {
        let mut table = Self {
            level,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for declared in TRACING_TARGETS {
            table.register(declared);
        }
        table
    }
    fn register(&mut self, declared: &DeclaredTarget) {
        let entry = TargetEntry::new(declared);
        let target = entry.target;
        let tags = entry.tags.clone();
        if let Some(exist) = self.targets.insert(target, entry) {
            warn!("Target {} has been multiply defined!", exist.target);
        }
        for tag in tags {
            match self.tags.get_mut(tag) {
                Some(known) => {
                    known.targets.insert(target);
                }
                None => {
                    self.tags.insert(tag, TagEntry::new(tag, target));
                }
            }
        }
    }
    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.level.to_string());
        for target in self.targets.values() {
            match format!("{}={}", target.target, target.level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => warn!("Skipping directive for target {}: {e}", target.target),
            }
        }
        filter
    }
    /// Config string reproducing the current levels. Targets are listed one by one,
    /// without attempting to group them by tag.
    pub(crate) fn as_config_string(&self) -> String {
        let mut out = format!("default={}", self.level);
        for target in self.targets.values() {
            out += &format!(",{}={}", target.name, target.level);
        }
        out
    }
    fn tagged_mut(&mut self, tag: &str) -> Vec<&mut TargetEntry> {
        let Some(tag) = self.tags.get(tag) else {
            return vec![];
        };
        let members = tag.targets.clone();
        self.targets
            .values_mut()
            .filter(|t| members.contains(t.target))
            .collect()
    }
}

pub struct TraceCtl {
    table: Mutex<TargetTable>,
    reload_filter: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TraceCtl {
    fn new() -> Self {
        let table = TargetTable::new(LevelFilter::INFO);
        let (filter, reload_filter) = reload::Layer::new(table.env_filter());

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true)
            .with_level(true);

        // another subscriber may own the global slot (tests); keep working without reload
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(tracing_error::ErrorLayer::default())
            .try_init()
            .is_ok();

        Self {
            table: Mutex::new(table),
            reload_filter: installed.then_some(reload_filter),
        }
    }
    fn reload(&self, table: &TargetTable) {
        if let Some(handle) = &self.reload_filter
            && let Err(e) = handle.reload(table.env_filter())
        {
            error!("Failed to reload tracing filter: {e}");
        }
    }
    #[cfg(test)]
    pub(crate) fn entry(&self, target: &str) -> Option<TargetEntry> {
        self.table.lock().targets.get(target).cloned()
    }
}

static TRACE_CTL: OnceLock<TraceCtl> = OnceLock::new();

/// Get the process-wide [`TraceCtl`], initializing it on first use.
pub fn get_trace_ctl() -> &'static TraceCtl {
    TRACE_CTL.get_or_init(TraceCtl::new)
}

/// Install `color-eyre` report handlers so that top-level failures carry span traces.
///
/// # Errors
/// Fails if a report handler was already installed.
pub fn install_error_reporting() -> color_eyre::Result<()> {
    get_trace_ctl();
    color_eyre::install()
}

impl TraceCtl {
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) {
        let mut table = self.table.lock();
        let mut changed = 0;
        for target in table.tagged_mut(tag) {
            if target.level != level {
                target.level = level;
                changed += 1;
            }
        }
        if changed > 0 {
            self.reload(&table);
        }
        debug!("Log level for tag '{tag}' is now {level}. Targets changed: {changed}");
    }
    fn set_level_all(&self, level: LevelFilter) {
        let mut table = self.table.lock();
        for target in table.targets.values_mut() {
            target.level = level;
        }
        self.reload(&table);
    }
    pub fn set_default_level(&self, level: LevelFilter) {
        let mut table = self.table.lock();
        if table.level != level {
            table.level = level;
            info!("Set default log level to {level}");
            self.reload(&table);
        }
    }

    /// Parse a comma-separated list of tag=level, level being off, error, warn, info, debug or trace
    fn parse_tracing_config(input: &str) -> Result<OrderMap<String, LevelFilter>, TraceCtlError> {
        let mut result = OrderMap::new();
        for item in input.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let Some((tag, level)) = item.split_once('=') else {
                return Err(TraceCtlError::BadSyntax(item.to_string()));
            };
            let level = LevelFilter::from_str(level.trim()).map_err(|_| {
                TraceCtlError::BadLevel(level.trim().to_string(), tag.trim().to_string())
            })?;
            result.insert(tag.trim().to_string(), level);
        }
        Ok(result)
    }

    /// Apply a tracing config string such as `default=error,all=info,pipeline=debug`.
    ///
    /// # Errors
    /// Fails on malformed items or on tags that no target carries.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let config = Self::parse_tracing_config(input)?;
        {
            let table = self.table.lock();
            if let Some(unknown) = config
                .keys()
                .find(|t| *t != "default" && *t != "all" && !table.tags.contains_key(t.as_str()))
            {
                return Err(TraceCtlError::UnknownTag(unknown.clone()));
            }
        }
        if let Some(level) = config.get("default") {
            self.set_default_level(*level);
        }
        if let Some(level) = config.get("all") {
            self.set_level_all(*level);
        }
        // per-tag settings win over "all"
        for (tag, level) in &config {
            if tag != "default" && tag != "all" {
                self.set_tag_level(tag, *level);
            }
        }
        Ok(())
    }

    pub fn dump_targets_by_tag(&self) {
        let table = self.table.lock();
        info!("{}", TargetTableByTag(&table));
    }
    pub fn dump(&self) {
        let table = self.table.lock();
        info!("{}", *table);
    }
    #[must_use]
    pub fn as_config_string(&self) -> String {
        self.table.lock().as_config_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::control::{TraceCtlError, get_trace_ctl};
    use crate::targets::{TRACING_TARGETS, TargetKind};
    use crate::{LevelFilter, custom_target, trace_target};
    use serial_test::serial;

    #[test]
    #[serial]
    fn static_targets_are_registered_on_first_use() {
        let tctl = get_trace_ctl();
        let own = tctl.entry(module_path!()).expect("Should be registered");
        assert_eq!(own.kind, TargetKind::Module);
        assert!(own.tags.contains(&"infra"));
        assert!(own.tags.contains(&"tracectl"));
    }

    #[test]
    #[serial]
    fn macros_collect_targets_at_link_time() {
        trace_target!("macro-auto", LevelFilter::ERROR, &[]);
        custom_target!("request-audit", LevelFilter::INFO, &["audit"]);

        let static_targets: Vec<&str> = TRACING_TARGETS.iter().map(|c| c.target).collect();
        assert!(static_targets.contains(&"request-audit"));
        assert!(static_targets.contains(&"declared-later"));

        let tctl = get_trace_ctl();
        let audit = tctl.entry("request-audit").expect("Should be registered");
        assert_eq!(audit.kind, TargetKind::Custom);
        assert_eq!(audit.name, "request-audit");
        assert!(tctl.entry("declared-later").is_some());

        custom_target!("declared-later", LevelFilter::OFF, &["audit"]);
    }

    #[test]
    #[serial]
    fn tag_level_changes_all_members() {
        const TAG: &str = "bus-tag";
        custom_target!("bus-publisher", LevelFilter::DEBUG, &[TAG]);
        custom_target!("bus-consumer", LevelFilter::ERROR, &[TAG]);
        custom_target!("bus-bystander", LevelFilter::ERROR, &[]);

        let tctl = get_trace_ctl();
        tctl.set_tag_level(TAG, LevelFilter::WARN);
        for target in ["bus-publisher", "bus-consumer"] {
            let entry = tctl.entry(target).expect("Should be registered");
            assert_eq!(entry.level, LevelFilter::WARN);
        }
        let bystander = tctl.entry("bus-bystander").expect("Should be registered");
        assert_eq!(bystander.level, LevelFilter::ERROR);
    }

    #[test]
    #[serial]
    fn setup_from_string_applies_and_rejects() {
        custom_target!("pipeline-test", LevelFilter::INFO, &["pipe-tag"]);
        custom_target!("pipeline-other", LevelFilter::INFO, &[]);
        let tctl = get_trace_ctl();

        tctl.setup_from_string("pipe-tag=off, all=debug, default=warn")
            .expect("Should succeed");
        let level = |target: &str| tctl.entry(target).map(|t| t.level);
        assert_eq!(level("pipeline-test"), Some(LevelFilter::OFF));
        assert_eq!(level("pipeline-other"), Some(LevelFilter::DEBUG));
        assert!(tctl.as_config_string().starts_with("default=warn"));

        assert!(matches!(
            tctl.setup_from_string("pipe-tag=bad"),
            Err(TraceCtlError::BadLevel(..))
        ));
        assert!(matches!(
            tctl.setup_from_string("pipe-tag=error, foo"),
            Err(TraceCtlError::BadSyntax(_))
        ));
        assert_eq!(
            tctl.setup_from_string("no-such-tag=info"),
            Err(TraceCtlError::UnknownTag("no-such-tag".to_string()))
        );
        tctl.setup_from_string("all=info, default=info")
            .expect("Should succeed");
    }
}
