// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of the tracing targets declared by every crate of the server.
//!
//! Crates declaring targets must depend on `linkme` themselves.

use crate::LevelFilter;
use linkme::distributed_slice;

/// Where the target string of a declaration comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// The module path of the declaring module.
    Module,
    /// A free-form target, such as the request audit log.
    Custom,
}

impl TargetKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Custom => "custom",
        }
    }
}

/// A target as declared in source, before the control table picks it up.
pub struct DeclaredTarget {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
    pub(crate) kind: TargetKind,
}

impl DeclaredTarget {
    /// A target named after the declaring module.
    #[must_use]
    pub const fn module(
        path: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target: path,
            name,
            level,
            tags,
            kind: TargetKind::Module,
        }
    }

    /// A target whose name is the target string itself.
    #[must_use]
    pub const fn custom(
        target: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name: target,
            level,
            tags,
            kind: TargetKind::Custom,
        }
    }
}

#[distributed_slice]
pub static TRACING_TARGETS: [DeclaredTarget];

#[macro_export]
macro_rules! trace_target_deps {
    () => {
        use linkme::distributed_slice;
        use $crate::LevelFilter;
        use $crate::targets::{DeclaredTarget, TRACING_TARGETS};
    };
}

/// Declare the tracing target of the calling module, with a name, default level and tags.
#[macro_export]
macro_rules! trace_target {
    // Each expansion lives in its own const scope so that imports don't clash and the
    // static gets a distinct linker name on every invocation.
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            use $crate::trace_target_deps;
            trace_target_deps!();

            #[distributed_slice(TRACING_TARGETS)]
            static TRACE_TGT: DeclaredTarget =
                DeclaredTarget::module(module_path!(), $name, $level, $tags);
        };
    };
}

/// Declare a target that is not a module path, such as the request audit log.
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            use $crate::trace_target_deps;
            trace_target_deps!();

            #[distributed_slice(TRACING_TARGETS)]
            static TRACE_TGT: DeclaredTarget =
                DeclaredTarget::custom($target, $level, $tags);
        };
    };
}
