// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The resource table and its indices.

use crate::backend::{self, Backend, MemBackend, row_key};
use crate::bus::{ChangeOper, MessageBus};
use crate::collection::{self, CollectionOp};
use crate::row::{Collection, Edge, MultiIndexRowMap, Parent, Row, annotated_fq_name, fq_key};
use config::registry::{ResourceDesc, registry};
use config::schema::Collection as Kind;
use config::validate::check_collection_element;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info};

/// Keys of a resource body that are not stored as fields.
const META_KEYS: &[&str] = &[
    "uuid",
    "fq_name",
    "name",
    "href",
    "parent_type",
    "parent_uuid",
    "parent_href",
];

/// A resource to be created.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub resource_type: &'static str,
    pub uuid: Uuid,
    pub fq_name: FqName,
    pub parent: Option<Parent>,
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Restrict properties, references, children and back-references to these fields.
    pub fields: Option<Vec<String>>,
    pub exclude_children: bool,
    pub exclude_backrefs: bool,
}

impl ReadOptions {
    /// Properties and references only.
    #[must_use]
    pub fn shallow() -> Self {
        Self {
            fields: None,
            exclude_children: true,
            exclude_backrefs: true,
        }
    }

    fn wants(&self, field: &str) -> bool {
        self.fields
            .as_ref()
            .is_none_or(|fields| fields.iter().any(|f| f == field))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub resource_type: String,
    pub parent_uuids: Option<Vec<Uuid>>,
    /// Only resources holding a reference to one of these.
    pub backref_uuids: Option<Vec<Uuid>>,
    pub obj_uuids: Option<Vec<Uuid>>,
    /// `field == one of values` on top-level properties.
    pub filters: Vec<(String, Vec<Value>)>,
    /// Return only ids greater than this one.
    pub marker: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub uuids: Vec<Uuid>,
    /// Set when the page is full; the next page starts after it.
    pub marker: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOp {
    Add,
    Delete,
}

/// A resource holding a reference to another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackRef {
    pub from_type: &'static str,
    pub uuid: Uuid,
    pub derived: bool,
    pub relaxed: bool,
}

/// What prevents a resource from being deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blockers {
    pub children: Vec<(&'static str, Uuid)>,
    pub backrefs: Vec<(&'static str, Uuid)>,
}

impl Blockers {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.backrefs.is_empty()
    }

    /// The refusal error, rendering each blocker with `href`.
    #[must_use]
    pub fn to_error(&self, href: impl Fn(&str, &Uuid) -> String) -> ApiError {
        let render = |list: &[(&'static str, Uuid)]| {
            list.iter()
                .map(|(ty, uuid)| format!("'{}'", href(ty, uuid)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        if self.children.is_empty() {
            ApiError::RefsExist(format!(
                "Delete when resource still referred: [{}]",
                render(&self.backrefs)
            ))
        } else {
            ApiError::RefsExist(format!(
                "Delete when children still present: [{}]",
                render(&self.children)
            ))
        }
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) rows: MultiIndexRowMap,
    /// target id -> ids of the resources referring to it
    pub(crate) backrefs: HashMap<Uuid, BTreeSet<Uuid>>,
    /// (type, annotated fq-name) -> id
    pub(crate) annotations: HashMap<(&'static str, Vec<String>), Uuid>,
    /// fq keys allocated and not yet created
    pub(crate) reserved: HashMap<String, Uuid>,
    pub(crate) reserved_ids: HashSet<Uuid>,
}

/// The resource table. All methods are synchronous; the lock is never held across an await.
///
/// Rows are written through to a [`Backend`] before they become visible.
pub struct ConfigDb {
    bus: Arc<MessageBus>,
    backend: Arc<dyn Backend>,
    pub(crate) state: RwLock<State>,
}

fn segments_repr(fq_name: &FqName) -> String {
    format!("{:?}", fq_name.segments())
}

impl Row {
    /// Properties with collections folded back into whole values.
    pub(crate) fn props_view(&self, desc: &ResourceDesc) -> Map<String, Value> {
        let mut props = self.props.clone();
        for (name, elems) in &self.collections {
            if let Some(prop) = desc.prop(name) {
                props.insert((*name).to_string(), collection::implode(prop.collection, elems));
            }
        }
        props
    }
}

fn edge_json(edge: &Edge, fq_name: Option<&FqName>) -> Value {
    json!({
        "to": fq_name,
        "uuid": edge.uuid.to_string(),
        "attr": edge.attr,
    })
}

impl State {
    fn row(&self, uuid: &Uuid) -> ApiResult<&Row> {
        self.rows.get_by_uuid(uuid).ok_or_else(|| ApiError::no_id(uuid))
    }

    fn fq_of(&self, uuid: &Uuid) -> Option<&FqName> {
        self.rows.get_by_uuid(uuid).map(|r| &r.fq_name)
    }

    fn children_of(&self, uuid: &Uuid) -> Vec<&Row> {
        let mut children = self.rows.get_by_parent_uuid(&Some(*uuid));
        children.sort_by_key(|r| r.uuid);
        children
    }

    fn backrefs_of(&self, uuid: &Uuid) -> Vec<BackRef> {
        let Some(referrers) = self.backrefs.get(uuid) else {
            return Vec::new();
        };
        referrers
            .iter()
            .filter_map(|from| self.rows.get_by_uuid(from))
            .filter_map(|from| {
                let edge = from.refs.iter().find(|e| e.uuid == *uuid)?;
                let derived = registry()
                    .lookup(from.ty)
                    .and_then(|d| d.ref_to(edge.to_type))
                    .is_some_and(|r| r.desc.derived);
                Some(BackRef {
                    from_type: from.ty,
                    uuid: from.uuid,
                    derived,
                    relaxed: edge.relaxed,
                })
            })
            .collect()
    }

    /// Parse the value of a reference field into edges, resolving names to ids.
    fn parse_edges(&self, desc: &ResourceDesc, field: &str, value: &Value) -> ApiResult<Vec<Edge>> {
        let Some(ref_field) = desc.ref_field(field) else {
            return Ok(Vec::new());
        };
        let target = ref_field.desc.to;
        let items = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => items,
            _ => {
                return Err(ApiError::bad_request(format!(
                    "Bad Request, {field} must be a list"
                )));
            }
        };
        let mut edges: Vec<Edge> = Vec::with_capacity(items.len());
        for item in items {
            let to = item
                .get("to")
                .and_then(|to| serde_json::from_value::<FqName>(to.clone()).ok())
                .filter(|fq| !fq.is_empty());
            let uuid = match item.get("uuid").and_then(Value::as_str) {
                Some(uuid) => {
                    let uuid = id::parse_canonical(uuid)?;
                    let peer = self.row(&uuid)?;
                    if peer.ty != target {
                        return Err(ApiError::bad_request(format!(
                            "Bad Request, {field} refers to {uuid} of type {}",
                            peer.ty
                        )));
                    }
                    if let Some(to) = &to
                        && *to != peer.fq_name
                    {
                        return Err(ApiError::bad_request(format!(
                            "Bad Request, {field} reference {to} does not match {uuid}"
                        )));
                    }
                    uuid
                }
                None => {
                    let to = to.ok_or_else(|| {
                        ApiError::bad_request(format!("Bad Request, {field} needs to or uuid"))
                    })?;
                    self.uuid_of(target, &to)
                        .ok_or_else(|| ApiError::no_fq_name(target, &to))?
                }
            };
            let attr = item.get("attr").filter(|a| !a.is_null()).cloned();
            // A repeated peer keeps its first position with the last attribute.
            if let Some(existing) = edges.iter_mut().find(|e| e.uuid == uuid) {
                existing.attr = attr;
            } else {
                edges.push(Edge {
                    to_type: target,
                    uuid,
                    attr,
                    relaxed: false,
                });
            }
        }
        Ok(edges)
    }

    fn uuid_of(&self, resource_type: &str, fq_name: &FqName) -> Option<Uuid> {
        self.rows
            .get_by_fq_key(&fq_key(resource_type, fq_name))
            .map(|r| r.uuid)
    }

    fn render(&self, row: &Row, opts: &ReadOptions) -> ApiResult<Map<String, Value>> {
        let desc = registry().get(row.ty)?;
        let mut out = Map::new();
        out.insert("uuid".into(), json!(row.uuid.to_string()));
        out.insert("fq_name".into(), json!(row.fq_name));
        out.insert("name".into(), json!(row.fq_name.name()));
        if let Some(parent) = &row.parent_uuid {
            out.insert("parent_type".into(), json!(row.parent_type));
            out.insert("parent_uuid".into(), json!(parent.to_string()));
        }
        for (name, value) in row.props_view(desc) {
            if name == "id_perms" || name == "perms2" || opts.wants(&name) {
                out.insert(name, value);
            }
        }
        for ref_field in &desc.refs {
            if !opts.wants(&ref_field.field) {
                continue;
            }
            let edges: Vec<Value> = row
                .refs
                .iter()
                .filter(|e| e.to_type == ref_field.desc.to)
                .map(|e| edge_json(e, self.fq_of(&e.uuid)))
                .collect();
            if !edges.is_empty() {
                out.insert(ref_field.field.clone(), Value::Array(edges));
            }
        }
        if !opts.exclude_children {
            let children = self.children_of(&row.uuid);
            for child_field in &desc.children {
                if !opts.wants(&child_field.field) {
                    continue;
                }
                let list: Vec<Value> = children
                    .iter()
                    .filter(|c| c.ty == child_field.child_type)
                    .map(|c| json!({"to": c.fq_name, "uuid": c.uuid.to_string()}))
                    .collect();
                if !list.is_empty() {
                    out.insert(child_field.field.clone(), Value::Array(list));
                }
            }
        }
        if !opts.exclude_backrefs {
            let mut grouped: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
            for backref in self.backrefs_of(&row.uuid) {
                let Some(field) = desc.backref_from(backref.from_type) else {
                    continue;
                };
                if !opts.wants(&field.field) {
                    continue;
                }
                let Some(from) = self.rows.get_by_uuid(&backref.uuid) else {
                    continue;
                };
                let attr = from
                    .refs
                    .iter()
                    .find(|e| e.uuid == row.uuid)
                    .and_then(|e| e.attr.clone());
                grouped.entry(field.field.as_str()).or_default().push(json!({
                    "to": from.fq_name,
                    "uuid": from.uuid.to_string(),
                    "attr": attr,
                }));
            }
            for (field, list) in grouped {
                out.insert(field.to_string(), Value::Array(list));
            }
        }
        Ok(out)
    }

    /// The body published with create and update records.
    fn publish_attrs(&self, row: &Row) -> Value {
        self.render(row, &ReadOptions::shallow())
            .map_or(Value::Null, Value::Object)
    }

    fn index(&mut self, row: &Row, desc: &ResourceDesc) {
        for edge in &row.refs {
            self.backrefs.entry(edge.uuid).or_default().insert(row.uuid);
        }
        if let Some(key) = annotated_fq_name(&row.props_view(desc)) {
            self.annotations.insert((row.ty, key), row.uuid);
        }
    }

    fn unindex(&mut self, row: &Row, desc: &ResourceDesc) {
        for edge in &row.refs {
            if let Some(set) = self.backrefs.get_mut(&edge.uuid) {
                set.remove(&row.uuid);
                if set.is_empty() {
                    self.backrefs.remove(&edge.uuid);
                }
            }
        }
        if let Some(key) = annotated_fq_name(&row.props_view(desc)) {
            let key = (row.ty, key);
            if self.annotations.get(&key) == Some(&row.uuid) {
                self.annotations.remove(&key);
            }
        }
    }

    /// Take a row out of the table together with its index entries.
    fn detach(&mut self, uuid: &Uuid) -> ApiResult<Row> {
        let row = self.rows.remove_by_uuid(uuid).ok_or_else(|| ApiError::no_id(uuid))?;
        let desc = registry().get(row.ty)?;
        self.unindex(&row, desc);
        Ok(row)
    }

    /// Put back a row previously detached.
    fn attach(&mut self, row: Row) -> ApiResult<()> {
        let desc = registry().get(row.ty)?;
        self.index(&row, desc);
        self.rows.insert(row);
        Ok(())
    }

    fn blockers(&self, uuid: &Uuid, ignore_default: bool) -> Blockers {
        let children = self
            .children_of(uuid)
            .into_iter()
            .filter(|c| {
                let derived = registry()
                    .lookup(c.ty)
                    .is_some_and(|d| d.ty.derived_child);
                let default = ignore_default
                    && (c.fq_name.name() == format!("default-{}", c.ty)
                        || c.fq_name.name() == "draft-policy-management");
                !derived && !default
            })
            .map(|c| (c.ty, c.uuid))
            .collect();
        let backrefs = self
            .backrefs_of(uuid)
            .into_iter()
            .filter(|b| !b.derived && !b.relaxed)
            .map(|b| (b.from_type, b.uuid))
            .collect();
        Blockers { children, backrefs }
    }
}

impl ConfigDb {
    /// A table persisting to process memory only.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self::with_backend(bus, Arc::new(MemBackend::new()))
    }

    /// A table over `backend`. Rows already stored there are seen after [`load`](Self::load).
    #[must_use]
    pub fn with_backend(bus: Arc<MessageBus>, backend: Arc<dyn Backend>) -> Self {
        Self {
            bus,
            backend,
            state: RwLock::new(State::default()),
        }
    }

    /// A table over `backend`, loaded.
    pub fn open(bus: Arc<MessageBus>, backend: Arc<dyn Backend>) -> ApiResult<Self> {
        let db = Self::with_backend(bus, backend);
        db.load()?;
        Ok(db)
    }

    /// Replace the table with the rows of the backend and rebuild every index. Returns the
    /// number of rows loaded.
    pub fn load(&self) -> ApiResult<usize> {
        let rows = backend::load(self.backend.as_ref())?;
        let mut state = State::default();
        for row in rows {
            if state.rows.get_by_fq_key(&row.fq_key).is_some() {
                return Err(ApiError::Internal(format!(
                    "Stored rows hold {} twice",
                    row.fq_key
                )));
            }
            state.attach(row)?;
        }
        let loaded = state.rows.len();
        *self.state.write() = state;
        info!("Loaded {loaded} resources from the backing store");
        Ok(loaded)
    }

    fn persist(&self, row: &Row) -> ApiResult<()> {
        self.backend.put(&row_key(&row.uuid), backend::encode(row)?)
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Change records not yet published.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.bus.pending()
    }

    /// Reserve an id for `(resource_type, fq_name)`.
    ///
    /// A name already taken conflicts unless `requested` is the id holding it.
    pub fn alloc(
        &self,
        resource_type: &str,
        fq_name: &FqName,
        requested: Option<Uuid>,
    ) -> ApiResult<Uuid> {
        let key = fq_key(resource_type, fq_name);
        let mut state = self.state.write();
        let existing = state
            .rows
            .get_by_fq_key(&key)
            .map(|r| r.uuid)
            .or_else(|| state.reserved.get(&key).copied());
        if let Some(existing) = existing {
            if requested == Some(existing) && state.reserved.contains_key(&key) {
                return Ok(existing);
            }
            return Err(ApiError::Conflict(format!(
                "{} already exists with uuid: {existing}",
                segments_repr(fq_name)
            )));
        }
        let uuid = match requested {
            Some(uuid) => {
                if let Some(row) = state.rows.get_by_uuid(&uuid) {
                    return Err(ApiError::Conflict(format!(
                        "{uuid} already exists with fq_name: {}",
                        segments_repr(&row.fq_name)
                    )));
                }
                if state.reserved_ids.contains(&uuid) {
                    return Err(ApiError::Conflict(format!("{uuid} already exists")));
                }
                uuid
            }
            None => Uuid::new_v4(),
        };
        state.reserved.insert(key, uuid);
        state.reserved_ids.insert(uuid);
        debug!("Allocated {uuid} for {resource_type} {fq_name}");
        Ok(uuid)
    }

    /// Undo an [`alloc`](Self::alloc) whose create did not happen.
    pub fn release(&self, resource_type: &str, fq_name: &FqName) {
        let mut state = self.state.write();
        if let Some(uuid) = state.reserved.remove(&fq_key(resource_type, fq_name)) {
            state.reserved_ids.remove(&uuid);
            debug!("Released {uuid} for {resource_type} {fq_name}");
        }
    }

    pub fn create(&self, new: NewRow) -> ApiResult<()> {
        let desc = registry().get(new.resource_type)?;
        let key = fq_key(new.resource_type, &new.fq_name);
        let mut state = self.state.write();
        if state.rows.get_by_fq_key(&key).is_some() {
            return Err(ApiError::Conflict(format!(
                "{} already exists",
                segments_repr(&new.fq_name)
            )));
        }
        if state.rows.get_by_uuid(&new.uuid).is_some() {
            return Err(ApiError::Conflict(format!("{} already exists", new.uuid)));
        }
        if let Some(reserved) = state.reserved.get(&key)
            && *reserved != new.uuid
        {
            return Err(ApiError::Conflict(format!(
                "{} is reserved for {reserved}",
                segments_repr(&new.fq_name)
            )));
        }
        if let Some(parent) = &new.parent {
            let parent_row = state.row(&parent.uuid)?;
            if parent_row.fq_name != new.fq_name.parent() {
                return Err(ApiError::bad_request(format!(
                    "Bad Request, fq_name {} does not extend parent {}",
                    new.fq_name, parent_row.fq_name
                )));
            }
        }
        let mut props = Map::new();
        let mut collections = BTreeMap::new();
        let mut refs = Vec::new();
        for (name, value) in new.body {
            if META_KEYS.contains(&name.as_str()) || value.is_null() {
                continue;
            }
            if let Some(prop) = desc.prop(&name) {
                match prop.collection {
                    Kind::None => {
                        props.insert(name, value);
                    }
                    kind => {
                        collections.insert(prop.name, collection::explode(kind, &value));
                    }
                }
            } else if desc.ref_field(&name).is_some() {
                refs.extend(state.parse_edges(desc, &name, &value)?);
            }
        }
        let row = Row {
            uuid: new.uuid,
            fq_key: key.clone(),
            resource_type: new.resource_type.to_string(),
            parent_uuid: new.parent.map(|p| p.uuid),
            ty: new.resource_type,
            parent_type: new.parent.map(|p| p.resource_type),
            fq_name: new.fq_name,
            props,
            collections,
            refs,
        };
        if !self
            .backend
            .compare_and_swap(&row_key(&row.uuid), None, backend::encode(&row)?)?
        {
            return Err(ApiError::Conflict(format!("{} already exists", row.uuid)));
        }
        state.reserved.remove(&key);
        state.reserved_ids.remove(&row.uuid);
        let attrs = state.publish_attrs(&row);
        self.bus
            .enqueue(ChangeOper::Create, row.ty, row.uuid, &row.fq_name, attrs);
        info!("Created {} {} ({})", row.ty, row.fq_name, row.uuid);
        state.attach(row)
    }

    pub fn read(&self, uuid: &Uuid, opts: &ReadOptions) -> ApiResult<Map<String, Value>> {
        let state = self.state.read();
        let row = state.row(uuid)?;
        state.render(row, opts)
    }

    /// Merge `patch` into the resource. A null property is removed; a reference field replaces
    /// every edge to that type, keeping the relaxed marker of retained edges.
    pub fn update(&self, uuid: &Uuid, patch: &Map<String, Value>) -> ApiResult<()> {
        let mut state = self.state.write();
        let current = state.row(uuid)?;
        let desc = registry().get(current.ty)?;
        let mut row = current.clone();
        for (name, value) in patch {
            if META_KEYS.contains(&name.as_str()) {
                continue;
            }
            if let Some(prop) = desc.prop(name) {
                match (prop.collection, value) {
                    (_, Value::Null) => {
                        row.props.remove(name);
                        row.collections.remove(prop.name);
                    }
                    (Kind::None, value) => {
                        row.props.insert(name.clone(), value.clone());
                    }
                    (kind, value) => {
                        row.collections
                            .insert(prop.name, collection::explode(kind, value));
                    }
                }
            } else if let Some(ref_field) = desc.ref_field(name) {
                let target = ref_field.desc.to;
                let mut edges = state.parse_edges(desc, name, value)?;
                for edge in &mut edges {
                    edge.relaxed = row
                        .refs
                        .iter()
                        .any(|old| old.uuid == edge.uuid && old.relaxed);
                }
                row.refs.retain(|e| e.to_type != target);
                row.refs.extend(edges);
            }
        }
        self.persist(&row)?;
        state.detach(uuid)?;
        let attrs = state.publish_attrs(&row);
        self.bus
            .enqueue(ChangeOper::Update, row.ty, row.uuid, &row.fq_name, attrs);
        debug!("Updated {} {}", row.ty, row.uuid);
        state.attach(row)
    }

    /// Children and back-references preventing deletion. Children named `default-<type>` are
    /// left out with `ignore_default`.
    pub fn blockers(&self, uuid: &Uuid, ignore_default: bool) -> ApiResult<Blockers> {
        let state = self.state.read();
        state.row(uuid)?;
        Ok(state.blockers(uuid, ignore_default))
    }

    /// Remove a resource, its derived children and its outgoing edges.
    ///
    /// Derived and relaxed edges of other resources pointing at it are dropped too.
    pub fn delete(&self, uuid: &Uuid) -> ApiResult<()> {
        let mut state = self.state.write();
        state.row(uuid)?;
        let blockers = state.blockers(uuid, false);
        if !blockers.is_empty() {
            return Err(blockers.to_error(|ty, uuid| format!("/{ty}/{uuid}")));
        }
        let mut doomed = vec![*uuid];
        let mut idx = 0;
        while idx < doomed.len() {
            let derived: Vec<Uuid> = state
                .children_of(&doomed[idx])
                .into_iter()
                .filter(|c| registry().lookup(c.ty).is_some_and(|d| d.ty.derived_child))
                .map(|c| c.uuid)
                .collect();
            doomed.extend(derived);
            idx += 1;
        }
        // Leaves first.
        for victim in doomed.iter().rev() {
            let referrers: Vec<Uuid> = state
                .backrefs
                .get(victim)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for referrer in referrers {
                if doomed.contains(&referrer) {
                    continue;
                }
                let mut row = state.detach(&referrer)?;
                row.refs.retain(|e| e.uuid != *victim);
                self.persist(&row)?;
                let attrs = state.publish_attrs(&row);
                self.bus
                    .enqueue(ChangeOper::Update, row.ty, row.uuid, &row.fq_name, attrs);
                state.attach(row)?;
            }
            self.backend.delete(&row_key(victim))?;
            let row = state.detach(victim)?;
            self.bus
                .enqueue(ChangeOper::Delete, row.ty, row.uuid, &row.fq_name, json!({}));
            info!("Deleted {} {} ({})", row.ty, row.fq_name, row.uuid);
        }
        Ok(())
    }

    pub fn list(&self, query: &ListQuery) -> ApiResult<ListPage> {
        if query.limit == Some(0) {
            return Err(ApiError::bad_request("Invalid page_limit 0"));
        }
        let state = self.state.read();
        let mut candidates: BTreeSet<Uuid> = state
            .rows
            .get_by_resource_type(&query.resource_type)
            .into_iter()
            .map(|r| r.uuid)
            .collect();
        if let Some(parents) = &query.parent_uuids {
            candidates.retain(|u| {
                state
                    .rows
                    .get_by_uuid(u)
                    .and_then(|r| r.parent_uuid)
                    .is_some_and(|p| parents.contains(&p))
            });
        }
        if let Some(targets) = &query.backref_uuids {
            let referrers: HashSet<Uuid> = targets
                .iter()
                .filter_map(|t| state.backrefs.get(t))
                .flatten()
                .copied()
                .collect();
            candidates.retain(|u| referrers.contains(u));
        }
        if let Some(wanted) = &query.obj_uuids {
            candidates.retain(|u| wanted.contains(u));
        }
        if !query.filters.is_empty() {
            candidates.retain(|u| {
                let Some(row) = state.rows.get_by_uuid(u) else {
                    return false;
                };
                let Ok(desc) = registry().get(row.ty) else {
                    return false;
                };
                let props = row.props_view(desc);
                query.filters.iter().all(|(field, values)| {
                    props
                        .get(field)
                        .is_some_and(|have| values.iter().any(|v| filter_match(have, v)))
                })
            });
        }
        let mut uuids: Vec<Uuid> = match &query.marker {
            Some(marker) => candidates
                .range((Bound::Excluded(*marker), Bound::Unbounded))
                .copied()
                .collect(),
            None => candidates.into_iter().collect(),
        };
        let mut marker = None;
        if let Some(limit) = query.limit
            && uuids.len() >= limit
        {
            uuids.truncate(limit);
            marker = uuids.last().copied();
        }
        Ok(ListPage { uuids, marker })
    }

    /// Add or remove one edge. Adding an existing edge replaces its attribute.
    pub fn ref_update(
        &self,
        uuid: &Uuid,
        ref_type: &str,
        ref_uuid: &Uuid,
        attr: Option<Value>,
        op: RefOp,
        relax: bool,
    ) -> ApiResult<()> {
        let mut state = self.state.write();
        let current = state.row(uuid)?;
        let desc = registry().get(current.ty)?;
        let target = desc
            .ref_to(ref_type)
            .ok_or_else(|| {
                ApiError::bad_request(format!(
                    "{} has no reference to {ref_type}",
                    current.ty
                ))
            })?
            .desc
            .to;
        let mut row = current.clone();
        match op {
            RefOp::Add => {
                let peer = state.row(ref_uuid)?;
                if peer.ty != target {
                    return Err(ApiError::bad_request(format!(
                        "{ref_uuid} is a {} not a {target}",
                        peer.ty
                    )));
                }
                if let Some(edge) = row.refs.iter_mut().find(|e| e.uuid == *ref_uuid) {
                    edge.attr = attr;
                    edge.relaxed |= relax;
                } else {
                    row.refs.push(Edge {
                        to_type: target,
                        uuid: *ref_uuid,
                        attr,
                        relaxed: relax,
                    });
                }
            }
            RefOp::Delete => {
                if !row.refs.iter().any(|e| e.uuid == *ref_uuid) {
                    return Ok(());
                }
                row.refs.retain(|e| e.uuid != *ref_uuid);
            }
        }
        self.persist(&row)?;
        state.detach(uuid)?;
        let attrs = state.publish_attrs(&row);
        self.bus
            .enqueue(ChangeOper::Update, row.ty, row.uuid, &row.fq_name, attrs);
        state.attach(row)
    }

    /// Mark the edge from `uuid` to `ref_uuid` as not blocking the deletion of `ref_uuid`.
    pub fn relax_ref(&self, uuid: &Uuid, ref_uuid: &Uuid) -> ApiResult<()> {
        let mut state = self.state.write();
        let row = state.row(uuid)?;
        if !row.refs.iter().any(|e| e.uuid == *ref_uuid && !e.relaxed) {
            return Ok(());
        }
        let mut row = row.clone();
        for edge in row.refs.iter_mut().filter(|e| e.uuid == *ref_uuid) {
            edge.relaxed = true;
        }
        self.persist(&row)?;
        state.detach(uuid)?;
        state.attach(row)
    }

    /// Apply element-wise list and map updates, all or nothing.
    pub fn prop_collection_update(&self, uuid: &Uuid, ops: &[CollectionOp]) -> ApiResult<()> {
        let mut state = self.state.write();
        let current = state.row(uuid)?;
        let desc = registry().get(current.ty)?;
        let mut row = current.clone();
        for op in ops {
            let prop = desc.prop(&op.field).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "{} neither \"ListProperty\" nor \"MapProperty\"",
                    op.field
                ))
            })?;
            op.check(prop.collection)?;
            let mut op = op.clone();
            if let Some(value) = op.value.as_mut() {
                check_collection_element(prop, value)?;
            }
            let elems: &mut Collection = row.collections.entry(prop.name).or_default();
            collection::apply(prop.collection, elems, &op)?;
        }
        self.persist(&row)?;
        state.detach(uuid)?;
        let attrs = state.publish_attrs(&row);
        self.bus
            .enqueue(ChangeOper::Update, row.ty, row.uuid, &row.fq_name, attrs);
        state.attach(row)
    }

    /// `{field: [[elem, position], ...]}` plus the `id_perms` of the resource.
    pub fn prop_collection_get(
        &self,
        uuid: &Uuid,
        fields: &[String],
        position: Option<&str>,
    ) -> ApiResult<Map<String, Value>> {
        let state = self.state.read();
        let row = state
            .rows
            .get_by_uuid(uuid)
            .ok_or_else(|| ApiError::NotFound(format!("Object Not Found: {uuid}")))?;
        let desc = registry().get(row.ty)?;
        let mut out = Map::new();
        for field in fields {
            let prop = desc
                .prop(field)
                .filter(|p| p.collection != Kind::None)
                .ok_or_else(|| {
                    ApiError::bad_request(format!(
                        "{field} neither \"ListProperty\" nor \"MapProperty\""
                    ))
                })?;
            let empty = Collection::new();
            let elems = row.collections.get(prop.name).unwrap_or(&empty);
            out.insert(field.clone(), collection::positioned(elems, position));
        }
        out.insert(
            "id_perms".into(),
            row.props.get("id_perms").cloned().unwrap_or(Value::Null),
        );
        Ok(out)
    }

    /// Whether `etag` is the current last-modified stamp of the resource.
    pub fn is_latest(&self, uuid: &Uuid, etag: &str) -> ApiResult<bool> {
        let state = self.state.read();
        Ok(state.row(uuid)?.last_modified() == Some(etag))
    }

    pub fn resource_type(&self, uuid: &Uuid) -> ApiResult<&'static str> {
        self.state.read().row(uuid).map(|r| r.ty)
    }

    pub fn fq_name(&self, uuid: &Uuid) -> ApiResult<FqName> {
        self.state.read().row(uuid).map(|r| r.fq_name.clone())
    }

    pub fn parent(&self, uuid: &Uuid) -> ApiResult<Option<Parent>> {
        self.state.read().row(uuid).map(|r| {
            r.parent_uuid.zip(r.parent_type).map(|(uuid, resource_type)| Parent {
                resource_type,
                uuid,
            })
        })
    }

    pub fn uuid_of(&self, resource_type: &str, fq_name: &FqName) -> ApiResult<Uuid> {
        self.state
            .read()
            .uuid_of(resource_type, fq_name)
            .ok_or_else(|| ApiError::no_fq_name(resource_type, fq_name))
    }

    #[must_use]
    pub fn exists(&self, uuid: &Uuid) -> bool {
        self.state.read().rows.get_by_uuid(uuid).is_some()
    }

    /// Locate a reflected resource by its annotated fq-name.
    #[must_use]
    pub fn uuid_by_annotation(&self, resource_type: &str, key: &[String]) -> Option<Uuid> {
        let ty = registry().lookup(resource_type)?.name();
        self.state
            .read()
            .annotations
            .get(&(ty, key.to_vec()))
            .copied()
    }

    /// Children as `(type, id)`, sorted by id.
    pub fn children(&self, uuid: &Uuid) -> ApiResult<Vec<(&'static str, Uuid)>> {
        let state = self.state.read();
        state.row(uuid)?;
        Ok(state
            .children_of(uuid)
            .into_iter()
            .map(|c| (c.ty, c.uuid))
            .collect())
    }

    pub fn backrefs(&self, uuid: &Uuid) -> ApiResult<Vec<BackRef>> {
        let state = self.state.read();
        state.row(uuid)?;
        Ok(state.backrefs_of(uuid))
    }

    /// Outgoing edges.
    pub fn refs(&self, uuid: &Uuid) -> ApiResult<Vec<Edge>> {
        self.state.read().row(uuid).map(|r| r.refs.clone())
    }

    /// Number of resources of a type, optionally under one parent.
    #[must_use]
    pub fn count(&self, resource_type: &str, parent: Option<&Uuid>) -> usize {
        let state = self.state.read();
        match parent {
            Some(parent) => state
                .rows
                .get_by_parent_uuid(&Some(*parent))
                .into_iter()
                .filter(|r| r.ty == resource_type)
                .count(),
            None => state
                .rows
                .get_by_resource_type(&resource_type.to_string())
                .len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn filter_match(have: &Value, wanted: &Value) -> bool {
    if have == wanted {
        return true;
    }
    match (have, wanted) {
        (Value::String(_), _) => false,
        (have, Value::String(wanted)) => have.to_string() == *wanted,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOperation;
    use pretty_assertions::assert_eq;

    fn db() -> ConfigDb {
        ConfigDb::new(Arc::new(MessageBus::new(1024)))
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn create(
        db: &ConfigDb,
        ty: &'static str,
        fq: &[&str],
        parent: Option<Parent>,
        body: Value,
    ) -> Uuid {
        let fq_name = FqName::from(fq);
        let uuid = db.alloc(ty, &fq_name, None).expect("Should alloc");
        db.create(NewRow {
            resource_type: ty,
            uuid,
            fq_name,
            parent,
            body: obj(body),
        })
        .expect("Should create");
        uuid
    }

    fn under(resource_type: &'static str, uuid: Uuid) -> Option<Parent> {
        Some(Parent { resource_type, uuid })
    }

    /// domain, project and one network
    fn base(db: &ConfigDb) -> (Uuid, Uuid, Uuid) {
        let domain = create(db, "domain", &["d"], None, json!({}));
        let project = create(db, "project", &["d", "p"], under("domain", domain), json!({}));
        let vn = create(
            db,
            "virtual-network",
            &["d", "p", "vn"],
            under("project", project),
            json!({"is_shared": false}),
        );
        (domain, project, vn)
    }

    #[test]
    fn alloc_conflicts_and_release() {
        let db = db();
        let fq = FqName::from(&["d"][..]);
        let uuid = db.alloc("domain", &fq, None).expect("Should alloc");
        assert_eq!(db.alloc("domain", &fq, Some(uuid)), Ok(uuid));
        let err = db.alloc("domain", &fq, None).expect_err("Should conflict");
        assert_eq!(err.status(), 409);
        assert!(err.to_string().contains("already exists with uuid"));
        db.release("domain", &fq);
        let again = db.alloc("domain", &fq, None).expect("Should alloc");
        assert_ne!(again, uuid);
        // a name of another type does not conflict
        assert!(db.alloc("project", &fq, None).is_ok());
    }

    #[test]
    fn create_read_with_children_and_backrefs() {
        let db = db();
        let (domain, project, vn) = base(&db);
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            under("project", project),
            json!({"virtual_network_refs": [{"to": ["d", "p", "vn"]}]}),
        );
        let read = db.read(&vn, &ReadOptions::default()).expect("Should read");
        assert_eq!(read["fq_name"], json!(["d", "p", "vn"]));
        assert_eq!(read["parent_type"], json!("project"));
        assert_eq!(read["parent_uuid"], json!(project.to_string()));
        assert_eq!(
            read["virtual_machine_interface_back_refs"],
            json!([{"to": ["d", "p", "port"], "uuid": vmi.to_string(), "attr": null}])
        );
        let port = db.read(&vmi, &ReadOptions::shallow()).expect("Should read");
        assert_eq!(
            port["virtual_network_refs"],
            json!([{"to": ["d", "p", "vn"], "uuid": vn.to_string(), "attr": null}])
        );
        let project_read = db.read(&project, &ReadOptions::default()).expect("Should read");
        assert_eq!(project_read["virtual_networks"][0]["uuid"], json!(vn.to_string()));
        assert_eq!(db.children(&domain).expect("Should list"), vec![("project", project)]);
        let no_children = db
            .read(&project, &ReadOptions::shallow())
            .expect("Should read");
        assert!(no_children.get("virtual_networks").is_none());
        assert_eq!(db.uuid_of("virtual-network", &FqName::from(&["d", "p", "vn"][..])), Ok(vn));
    }

    #[test]
    fn create_rejects_unknown_ref_target_and_bad_parent() {
        let db = db();
        let (_, project, _) = base(&db);
        let fq = FqName::from(&["d", "p", "port"][..]);
        let uuid = db.alloc("virtual-machine-interface", &fq, None).expect("Should alloc");
        let err = db
            .create(NewRow {
                resource_type: "virtual-machine-interface",
                uuid,
                fq_name: fq,
                parent: under("project", project),
                body: obj(json!({"virtual_network_refs": [{"to": ["d", "p", "nope"]}]})),
            })
            .expect_err("Should fail");
        assert!(err.is_not_found());

        let fq = FqName::from(&["x", "vn2"][..]);
        let uuid = db.alloc("virtual-network", &fq, None).expect("Should alloc");
        let err = db
            .create(NewRow {
                resource_type: "virtual-network",
                uuid,
                fq_name: fq,
                parent: under("project", project),
                body: Map::new(),
            })
            .expect_err("Should fail");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn delete_refused_while_referred() {
        let db = db();
        let (_, project, vn) = base(&db);
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            under("project", project),
            json!({"virtual_network_refs": [{"uuid": vn.to_string()}]}),
        );
        let err = db.delete(&vn).expect_err("Should refuse");
        assert_eq!(err.status(), 409);
        assert!(err.to_string().contains(&format!("/virtual-machine-interface/{vmi}")));
        let err = db.delete(&project).expect_err("Should refuse");
        assert!(err.to_string().starts_with("Delete when children still present"));

        db.relax_ref(&vmi, &vn).expect("Should relax");
        db.delete(&vn).expect("Should delete");
        let port = db.read(&vmi, &ReadOptions::shallow()).expect("Should read");
        assert!(port.get("virtual_network_refs").is_none());
    }

    #[test]
    fn delete_cascades_derived_children() {
        let db = db();
        let (_, _, vn) = base(&db);
        let ri = create(
            &db,
            "routing-instance",
            &["d", "p", "vn", "vn"],
            under("virtual-network", vn),
            json!({"routing_instance_is_default": true}),
        );
        assert!(db.blockers(&vn, false).expect("Should check").is_empty());
        db.delete(&vn).expect("Should delete");
        assert!(!db.exists(&ri));
        assert!(db.read(&vn, &ReadOptions::default()).is_err());
    }

    #[test]
    fn default_children_are_ignored_on_request() {
        let db = db();
        let (_, project, _) = base(&db);
        let blockers = db.blockers(&project, true).expect("Should check");
        assert_eq!(blockers.children.len(), 1);
        create(
            &db,
            "security-group",
            &["d", "p", "default-security-group"],
            under("project", project),
            json!({}),
        );
        let blockers = db.blockers(&project, true).expect("Should check");
        assert_eq!(blockers.children.len(), 1);
        let blockers = db.blockers(&project, false).expect("Should check");
        assert_eq!(blockers.children.len(), 2);
    }

    #[test]
    fn update_merges_and_keeps_relaxed_edges() {
        let db = db();
        let (_, project, vn) = base(&db);
        let sg = create(
            &db,
            "security-group",
            &["d", "p", "sg"],
            under("project", project),
            json!({}),
        );
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            under("project", project),
            json!({"virtual_network_refs": [{"uuid": vn.to_string()}]}),
        );
        db.relax_ref(&vmi, &vn).expect("Should relax");
        db.update(
            &vmi,
            &obj(json!({
                "display_name": "p",
                "virtual_network_refs": [{"uuid": vn.to_string()}],
                "security_group_refs": [{"to": ["d", "p", "sg"]}],
                "fq_name": ["ignored"],
            })),
        )
        .expect("Should update");
        let edges = db.refs(&vmi).expect("Should read");
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().any(|e| e.uuid == vn && e.relaxed));
        assert!(edges.iter().any(|e| e.uuid == sg && !e.relaxed));
        let read = db.read(&vmi, &ReadOptions::shallow()).expect("Should read");
        assert_eq!(read["display_name"], json!("p"));
        assert_eq!(read["fq_name"], json!(["d", "p", "port"]));

        db.update(&vmi, &obj(json!({"display_name": null, "security_group_refs": []})))
            .expect("Should update");
        let read = db.read(&vmi, &ReadOptions::shallow()).expect("Should read");
        assert!(read.get("display_name").is_none());
        assert!(read.get("security_group_refs").is_none());
        assert!(db.backrefs(&sg).expect("Should read").is_empty());
    }

    #[test]
    fn ref_update_is_idempotent() {
        let db = db();
        let (_, project, vn) = base(&db);
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            under("project", project),
            json!({}),
        );
        for _ in 0..2 {
            db.ref_update(&vmi, "virtual-network", &vn, None, RefOp::Add, false)
                .expect("Should add");
        }
        assert_eq!(db.refs(&vmi).expect("Should read").len(), 1);
        for _ in 0..2 {
            db.ref_update(&vmi, "virtual-network", &vn, None, RefOp::Delete, false)
                .expect("Should delete");
        }
        assert!(db.refs(&vmi).expect("Should read").is_empty());
        assert!(db.ref_update(&vmi, "domain", &vn, None, RefOp::Add, false).is_err());
    }

    #[test]
    fn list_filters_and_pages() {
        let db = db();
        let (_, project, vn) = base(&db);
        let mut all = vec![vn];
        for idx in 0..4 {
            all.push(create(
                &db,
                "virtual-network",
                &["d", "p", &format!("vn{idx}")],
                under("project", project),
                json!({"is_shared": idx % 2 == 0}),
            ));
        }
        all.sort();
        let query = ListQuery {
            resource_type: "virtual-network".to_string(),
            limit: Some(2),
            ..ListQuery::default()
        };
        let first = db.list(&query).expect("Should list");
        assert_eq!(first.uuids, all[..2].to_vec());
        assert_eq!(first.marker, Some(all[1]));
        let second = db
            .list(&ListQuery {
                marker: first.marker,
                limit: Some(10),
                ..query.clone()
            })
            .expect("Should list");
        assert_eq!(second.uuids, all[2..].to_vec());
        assert_eq!(second.marker, None);

        let shared = db
            .list(&ListQuery {
                resource_type: "virtual-network".to_string(),
                filters: vec![("is_shared".to_string(), vec![json!("true")])],
                ..ListQuery::default()
            })
            .expect("Should list");
        assert_eq!(shared.uuids.len(), 2);
        let other_parent = db
            .list(&ListQuery {
                resource_type: "virtual-network".to_string(),
                parent_uuids: Some(vec![vn]),
                ..ListQuery::default()
            })
            .expect("Should list");
        assert!(other_parent.uuids.is_empty());
        assert_eq!(db.count("virtual-network", Some(&project)), 5);
    }

    #[test]
    fn backref_listing() {
        let db = db();
        let (_, project, vn) = base(&db);
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            under("project", project),
            json!({"virtual_network_refs": [{"uuid": vn.to_string()}]}),
        );
        create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "other"],
            under("project", project),
            json!({}),
        );
        let page = db
            .list(&ListQuery {
                resource_type: "virtual-machine-interface".to_string(),
                backref_uuids: Some(vec![vn]),
                ..ListQuery::default()
            })
            .expect("Should list");
        assert_eq!(page.uuids, vec![vmi]);
    }

    #[test]
    fn collections_update_and_get() {
        let db = db();
        let (_, _, vn) = base(&db);
        let set = |key: &str, value: &str| CollectionOp {
            field: "annotations".to_string(),
            operation: CollectionOperation::Set,
            value: Some(json!({"key": key, "value": value})),
            position: None,
        };
        db.prop_collection_update(&vn, &[set("k1", "a"), set("k2", "b")])
            .expect("Should update");
        db.prop_collection_update(
            &vn,
            &[CollectionOp {
                field: "annotations".to_string(),
                operation: CollectionOperation::Delete,
                value: None,
                position: Some("k1".to_string()),
            }],
        )
        .expect("Should update");
        let got = db
            .prop_collection_get(&vn, &["annotations".to_string()], None)
            .expect("Should get");
        assert_eq!(got["annotations"], json!([[{"key": "k2", "value": "b"}, "k2"]]));
        let read = db.read(&vn, &ReadOptions::shallow()).expect("Should read");
        assert_eq!(
            read["annotations"],
            json!({"key_value_pair": [{"key": "k2", "value": "b"}]})
        );
        let err = db
            .prop_collection_get(&vn, &["is_shared".to_string()], None)
            .expect_err("Should fail");
        assert!(err.to_string().contains("neither"));
        let err = db
            .prop_collection_get(&Uuid::new_v4(), &["annotations".to_string()], None)
            .expect_err("Should fail");
        assert!(err.to_string().starts_with("Object Not Found"));
    }

    #[test]
    fn annotation_index_follows_writes() {
        let db = db();
        let (_, project, _) = base(&db);
        let kvp = |name: &str| {
            json!({"annotations": {"key_value_pair": [
                {"key": "project", "value": "p"},
                {"key": "cluster", "value": "c"},
                {"key": "owner", "value": "k8s"},
                {"key": "kind", "value": "Pod"},
                {"key": "name", "value": name},
            ]}})
        };
        let vm = create(&db, "virtual-machine", &["pod-a"], None, kvp("web"));
        let key: Vec<String> = ["p", "c", "k8s", "Pod", "web"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(db.uuid_by_annotation("virtual_machine", &key), Some(vm));
        db.update(&vm, &obj(kvp("api"))).expect("Should update");
        assert_eq!(db.uuid_by_annotation("virtual-machine", &key), None);
        db.delete(&vm).expect("Should delete");
        assert_eq!(db.count("project", None), 1);
        let _ = project;
    }

    #[test]
    fn writes_are_published_in_commit_order() {
        let db = db();
        let (_, _, vn) = base(&db);
        db.update(&vn, &obj(json!({"display_name": "x"}))).expect("Should update");
        db.delete(&vn).expect("Should delete");
        assert_eq!(db.pending(), 5);
        db.bus().drain();
        let (records, _rx) = db.bus().subscribe(0);
        let opers: Vec<ChangeOper> = records.iter().map(|r| r.oper).collect();
        assert_eq!(
            opers,
            vec![
                ChangeOper::Create,
                ChangeOper::Create,
                ChangeOper::Create,
                ChangeOper::Update,
                ChangeOper::Delete
            ]
        );
        assert_eq!(records[3].attrs["display_name"], json!("x"));
        assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn reopened_table_rebuilds_its_indices() {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new());
        let bus = || Arc::new(MessageBus::new(1024));
        let db = ConfigDb::open(bus(), backend.clone()).expect("Should open");
        let (_, project, vn) = base(&db);
        let vmi = create(
            &db,
            "virtual-machine-interface",
            &["d", "p", "port"],
            under("project", project),
            json!({
                "virtual_network_refs": [{"to": ["d", "p", "vn"]}],
                "annotations": {"key_value_pair": [{"key": "k", "value": "v"}]}
            }),
        );
        let gone = create(
            &db,
            "virtual-network",
            &["d", "p", "gone"],
            under("project", project),
            json!({}),
        );
        db.delete(&gone).expect("Should delete");
        db.relax_ref(&vmi, &vn).expect("Should relax");
        drop(db);

        let db = ConfigDb::open(bus(), backend).expect("Should reopen");
        assert_eq!(db.len(), 4);
        let fq = FqName::from(&["d", "p", "vn"][..]);
        assert_eq!(db.uuid_of("virtual-network", &fq), Ok(vn));
        let gone_fq = FqName::from(&["d", "p", "gone"][..]);
        assert!(db.uuid_of("virtual-network", &gone_fq).is_err());
        assert_eq!(db.children(&project).expect("Should list").len(), 2);
        let backrefs = db.backrefs(&vn).expect("Should list");
        assert_eq!(backrefs.len(), 1);
        assert!(backrefs[0].relaxed);
        let port = db.read(&vmi, &ReadOptions::shallow()).expect("Should read");
        assert_eq!(port["annotations"]["key_value_pair"][0]["value"], json!("v"));
        // the name is still taken
        assert!(db.alloc("virtual-network", &fq, None).is_err());
    }

    #[test]
    fn etag_check() {
        let db = db();
        let (_, project, _) = base(&db);
        let vn = create(
            &db,
            "virtual-network",
            &["d", "p", "stamped"],
            under("project", project),
            json!({"id_perms": {"last_modified": "2024-01-01T00:00:00.000000"}}),
        );
        assert_eq!(db.is_latest(&vn, "2024-01-01T00:00:00.000000"), Ok(true));
        assert_eq!(db.is_latest(&vn, "2023"), Ok(false));
    }
}
