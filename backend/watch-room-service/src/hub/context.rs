//! Request-scoped connection context for hub calls.
//!
//! The context filter binds the caller's connection into a tokio task-local
//! for the duration of one call, so handlers can resolve "who is calling"
//! without threading the connection through every signature.

use std::future::Future;
use uuid::Uuid;

use super::registry::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: Uuid,
}

tokio::task_local! {
    static CURRENT: ConnectionContext;
}

impl ConnectionContext {
    pub fn new(connection_id: ConnectionId, user_id: Uuid) -> Self {
        Self {
            connection_id,
            user_id,
        }
    }

    /// Run `fut` with this context bound. The binding ends when `fut` completes.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Context of the call being executed, if any.
    pub fn current() -> Option<ConnectionContext> {
        CURRENT.try_with(|ctx| *ctx).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_binds_and_tears_down() {
        let ctx = ConnectionContext::new(ConnectionId::new(), Uuid::new_v4());
        assert!(ConnectionContext::current().is_none());

        let seen = ctx.scope(async { ConnectionContext::current() }).await;
        assert_eq!(seen, Some(ctx));

        assert!(ConnectionContext::current().is_none());
    }

    #[tokio::test]
    async fn test_nested_scopes_do_not_leak() {
        let outer = ConnectionContext::new(ConnectionId::new(), Uuid::new_v4());
        let inner = ConnectionContext::new(ConnectionId::new(), Uuid::new_v4());

        outer
            .scope(async move {
                let seen = inner.scope(async { ConnectionContext::current() }).await;
                assert_eq!(seen, Some(inner));
                assert_eq!(ConnectionContext::current(), Some(outer));
            })
            .await;
    }
}
