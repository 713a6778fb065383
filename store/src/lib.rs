// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Persistence and mapping layer.
//!
//! [`ConfigDb`] holds one row per resource together with the indices the API needs:
//! fq-name to id, id to parent, id to back-references and annotated fq-name to id. Every
//! committed write is enqueued on the [`MessageBus`] in commit order. Rows persist through a
//! [`Backend`].

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod backend;
mod bus;
mod check;
mod collection;
mod db;
mod row;
mod useragent;

pub use backend::{Backend, MemBackend};
pub use bus::{ChangeOper, ChangeRecord, MessageBus};
pub use collection::{CollectionOp, CollectionOperation};
pub use db::{BackRef, Blockers, ConfigDb, ListPage, ListQuery, NewRow, ReadOptions, RefOp};
pub use row::{ANNOTATION_KEYS, Edge, Parent, annotated_fq_name};
pub use useragent::UserAgentKv;

use tracectl::trace_target;
trace_target!("store", LevelFilter::INFO, &["store"]);
