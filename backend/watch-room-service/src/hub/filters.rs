//! Filters wrapped around every hub call, outermost first:
//! connection context, exception translation, metrics.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use super::context::ConnectionContext;
use super::events::Event;
use super::registry::ConnectionRegistry;
use super::HubCall;
use crate::error::AppResult;
use crate::metrics::observe_hub_call;

/// Terminal handler the filter chain leads to.
#[async_trait]
pub trait HubEndpoint: Send + Sync {
    async fn dispatch(&self, call: &HubCall) -> AppResult<()>;
}

#[async_trait]
pub trait HubFilter: Send + Sync {
    async fn invoke(&self, call: &HubCall, next: Next<'_>) -> AppResult<()>;
}

/// Remainder of the chain after the current filter.
pub struct Next<'a> {
    filters: &'a [Arc<dyn HubFilter>],
    endpoint: &'a dyn HubEndpoint,
}

impl<'a> Next<'a> {
    pub fn new(filters: &'a [Arc<dyn HubFilter>], endpoint: &'a dyn HubEndpoint) -> Self {
        Self { filters, endpoint }
    }

    pub async fn run(self, call: &HubCall) -> AppResult<()> {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                filter
                    .invoke(call, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.dispatch(call).await,
        }
    }
}

/// Binds the caller's connection for the duration of the call.
pub struct ConnectionContextFilter;

#[async_trait]
impl HubFilter for ConnectionContextFilter {
    async fn invoke(&self, call: &HubCall, next: Next<'_>) -> AppResult<()> {
        let span = tracing::info_span!(
            "hub_call",
            connection_id = %call.context.connection_id,
            user_id = %call.context.user_id,
            method = call.request.method(),
        );
        call.context
            .scope(next.run(call))
            .instrument(span)
            .await
    }
}

/// Turns a failure into an `ErrorNotificationEvent` for the caller only,
/// then hands the error on unchanged.
pub struct ExceptionTranslationFilter {
    registry: ConnectionRegistry,
}

impl ExceptionTranslationFilter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HubFilter for ExceptionTranslationFilter {
    async fn invoke(&self, call: &HubCall, next: Next<'_>) -> AppResult<()> {
        let result = next.run(call).await;
        if let Err(e) = &result {
            let connection_id = ConnectionContext::current()
                .map(|ctx| ctx.connection_id)
                .unwrap_or(call.context.connection_id);
            let event = Event::ErrorNotificationEvent {
                message: e.user_message(),
            };
            self.registry.send_to(connection_id, &event).await;
        }
        result
    }
}

/// Records `hub_method_duration_seconds{method,outcome}`.
pub struct MetricsFilter;

#[async_trait]
impl HubFilter for MetricsFilter {
    async fn invoke(&self, call: &HubCall, next: Next<'_>) -> AppResult<()> {
        let started = Instant::now();
        let result = next.run(call).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        observe_hub_call(
            call.request.method(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }
}

/// The default chain in its required order.
pub fn default_filters(registry: ConnectionRegistry) -> Vec<Arc<dyn HubFilter>> {
    vec![
        Arc::new(ConnectionContextFilter),
        Arc::new(ExceptionTranslationFilter::new(registry)),
        Arc::new(MetricsFilter),
    ]
}
