use crate::client::{CallOptions, Client, Route};
use crate::error::ClientError;

use super::{PersistentSubscriptionInfo, PersistentSubscriptionSettings, PersistentTarget};

impl Client {
    /// Creates a group. Fails with `ResourceAlreadyExists` when it exists.
    #[tracing::instrument(skip_all, fields(target = %target, group = %group))]
    pub async fn create_persistent_subscription(
        &self,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
        call: &CallOptions,
    ) -> Result<(), ClientError> {
        settings.validate(target)?;
        self.execute("create_persistent", call, Route::Leader, |conn, ctx| async move {
            conn.channel()
                .create_persistent(&ctx, target, group, settings)
                .await
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(target = %target, group = %group))]
    pub async fn update_persistent_subscription(
        &self,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
        call: &CallOptions,
    ) -> Result<(), ClientError> {
        settings.validate(target)?;
        self.execute("update_persistent", call, Route::Leader, |conn, ctx| async move {
            conn.channel()
                .update_persistent(&ctx, target, group, settings)
                .await
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(target = %target, group = %group))]
    pub async fn delete_persistent_subscription(
        &self,
        target: &PersistentTarget,
        group: &str,
        call: &CallOptions,
    ) -> Result<(), ClientError> {
        self.execute("delete_persistent", call, Route::Leader, |conn, ctx| async move {
            conn.channel().delete_persistent(&ctx, target, group).await
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(target = %target, group = %group))]
    pub async fn get_persistent_subscription_info(
        &self,
        target: &PersistentTarget,
        group: &str,
        call: &CallOptions,
    ) -> Result<PersistentSubscriptionInfo, ClientError> {
        self.execute("persistent_info", call, Route::Leader, |conn, ctx| async move {
            conn.channel().persistent_info(&ctx, target, group).await
        })
        .await
    }

    /// Groups reading `target`, or every group when `target` is `None`.
    #[tracing::instrument(skip_all)]
    pub async fn list_persistent_subscriptions(
        &self,
        target: Option<&PersistentTarget>,
        call: &CallOptions,
    ) -> Result<Vec<PersistentSubscriptionInfo>, ClientError> {
        self.execute("list_persistent", call, Route::Leader, |conn, ctx| async move {
            conn.channel().list_persistent(&ctx, target).await
        })
        .await
    }

    /// Moves parked events back to the group's delivery queue. `stop_at`
    /// bounds how many are replayed.
    #[tracing::instrument(skip_all, fields(target = %target, group = %group))]
    pub async fn replay_parked_messages(
        &self,
        target: &PersistentTarget,
        group: &str,
        stop_at: Option<u64>,
        call: &CallOptions,
    ) -> Result<(), ClientError> {
        self.execute("replay_parked", call, Route::Leader, |conn, ctx| async move {
            conn.channel()
                .replay_parked(&ctx, target, group, stop_at)
                .await
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    pub async fn restart_persistent_subscription_subsystem(
        &self,
        call: &CallOptions,
    ) -> Result<(), ClientError> {
        self.execute("restart_persistent_subsystem", call, Route::Leader, |conn, ctx| async move {
            conn.channel().restart_persistent_subsystem(&ctx).await
        })
        .await
    }
}
