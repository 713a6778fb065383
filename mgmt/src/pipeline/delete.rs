// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::state::{DeleteState, Stage};
use super::undo::CompensationList;
use super::{Outcome, audit, perms_of, resource_desc};
use crate::context::RequestContext;
use crate::hooks::DRAFT_POLICY_MANAGEMENT;
use crate::server::ApiServer;
use config::registry::object_type;
use config::{ApiError, ApiResult, ResourceDesc};
use id::Uuid;
use perms::{Crud, Perms2};
use serde_json::json;
use store::ReadOptions;
use tracing::{debug, error};

impl ApiServer {
    /// Delete the resource `uuid` of `resource_type` together with its default children.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        resource_type: &str,
        uuid: &Uuid,
    ) -> ApiResult<Outcome> {
        let desc = resource_desc(resource_type)?;
        let ty = desc.name();
        let mut stage = Stage::new(
            &ctx.request_id,
            format!("delete {ty} {uuid}"),
            DeleteState::Initial,
        );
        let mut undo = CompensationList::new();
        let result = self
            .delete_stages(ctx, desc, uuid, &mut stage, &mut undo)
            .await;
        match &result {
            Ok(_) => audit(ctx, "delete", ty, Some(uuid), Ok(())),
            Err(e) => {
                stage.failed(e);
                undo.unwind(self, ctx).await;
                audit(ctx, "delete", ty, Some(uuid), Err(e));
            }
        }
        result
    }

    async fn delete_stages(
        &self,
        ctx: &RequestContext,
        desc: &'static ResourceDesc,
        uuid: &Uuid,
        stage: &mut Stage<DeleteState>,
        undo: &mut CompensationList,
    ) -> ApiResult<Outcome> {
        let ty = desc.name();
        let hooks = self.hooks(ty);
        self.check_backpressure()?;
        if self.db().resource_type(uuid)? != ty {
            return Err(ApiError::no_id(uuid));
        }
        let current = self.db().read(uuid, &ReadOptions::shallow())?;
        self.check_rbac(ctx, ty, &[], Crud::Delete)?;
        let parent = self.db().parent(uuid)?;
        if !self.perms().is_admin(&ctx.identity) {
            let parent_perms: Option<Perms2> =
                parent.map(|p| perms_of(self, &p.uuid)).transpose()?;
            self.perms().check_delete(
                &ctx.identity,
                &Perms2::of(&current),
                parent_perms.as_ref(),
            )?;
        }
        stage.enter(DeleteState::Validated);

        stage.enter(DeleteState::PendingDbeDelete);
        if let Some(body) = hooks.pending_delete(self, ctx, &current).await? {
            return Ok(Outcome::accepted(body));
        }

        let blockers = self.db().blockers(uuid, true)?;
        if !blockers.is_empty() {
            return Err(blockers.to_error(|ty, id| self.href(ty, id)));
        }

        stage.enter(DeleteState::PreDbeDelete);
        hooks.pre_delete(self, ctx, &current, undo).await?;

        stage.enter(DeleteState::DbeDelete);
        self.check_backpressure()?;
        for (child_type, child) in self.db().children(uuid)? {
            let name = self.db().fq_name(&child)?;
            if name.name() == format!("default-{child_type}") || name.name() == DRAFT_POLICY_MANAGEMENT
            {
                debug!("{}: deleting default child {child_type} {child}", ctx.request_id);
                self.delete_boxed(ctx.as_internal(), child_type, child)
                    .await?;
            }
        }
        self.invalidate_around(uuid);
        self.db().delete(uuid)?;
        if desc.quota_tracked()
            && let Some(parent) = parent.filter(|p| p.resource_type == "project")
        {
            self.quota().decrement(&parent.uuid, &object_type(ty)).await;
        }

        stage.enter(DeleteState::PostDbeDelete);
        if let Err(e) = hooks.post_delete(self, ctx, &current).await {
            error!("{}: post-delete of {ty} {uuid} failed: {e}", ctx.request_id);
        }
        stage.enter(DeleteState::Done);
        Ok(Outcome::ok(json!({ "uuid": uuid.to_string() })))
    }

    /// Delete a resource if it still exists, ignoring a concurrent removal.
    pub(crate) async fn delete_if_exists(
        &self,
        ctx: &RequestContext,
        resource_type: &'static str,
        uuid: Uuid,
    ) -> ApiResult<()> {
        match self.delete_boxed(ctx.as_internal(), resource_type, uuid).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

