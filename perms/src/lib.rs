// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Who may do what: request identities, token validation, object permissions, role based
//! access rules and per-project quota counters.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod access;
mod auth;
mod identity;
mod quota;
mod rbac;

pub use access::{PERMS_NONE, PERMS_R, PERMS_RW, PERMS_RWX, PERMS_W, PERMS_X, PermEngine, Perms2, ShareEntry, access_string};
pub use auth::{AuthError, AuthService, CachedAuth, StaticAuth, TokenInfo};
pub use identity::Identity;
pub use quota::{QuotaCounters, QuotaTicket, quota_limit};
pub use rbac::{Crud, RbacPerm, RbacRule, default_rules, merge_rules};

use tracectl::trace_target;
trace_target!("perms", LevelFilter::INFO, &["perms"]);
