//! Boundary to the per-tenant application
//!
//! The router resolves a tenant, then hands the request to whatever
//! `TenantHandler` is registered for it. Handlers report failures through
//! `HandlerError`, marking them fatal when the whole process should stop
//! serving.

use crate::adapter::{BodyError, RequestAdapter, ResponseAdapter};
use crate::router::RequestUrl;
use crate::tenant::{Protocol, Tenant};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Everything the router learned about a request before dispatching it
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub tenant: Arc<Tenant>,
    pub url: RequestUrl,
    /// Host header with any port stripped, lower-cased
    pub host: String,
    /// Local port of the listener the request arrived on
    pub port: u16,
    pub protocol: Protocol,
    pub request_id: String,
}

/// Failure reported by a tenant handler
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    fatal: bool,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// A failure that should tear down every listener
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
            source: None,
        }
    }

    /// A failure confined to this request
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
            source: None,
        }
    }

    pub(crate) fn panicked(message: &str) -> Self {
        Self::fatal(format!("handler panicked: {}", message))
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<BodyError> for HandlerError {
    fn from(err: BodyError) -> Self {
        HandlerError::recoverable("failed to read request body").with_source(err)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::fatal("I/O failure in tenant handler").with_source(err)
    }
}

/// A tenant's application logic.
///
/// The returned future may suspend (reading the body, awaiting storage,
/// ...). If it returns without ending the response, the router ends it.
pub trait TenantHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a RoutedRequest,
        req: &'a mut RequestAdapter,
        res: &'a mut ResponseAdapter,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Tenant name -> handler, with a fallback for unregistered tenants
#[derive(Clone)]
pub struct HandlerRegistry {
    by_tenant: HashMap<String, Arc<dyn TenantHandler>>,
    fallback: Arc<dyn TenantHandler>,
}

impl HandlerRegistry {
    pub fn new(fallback: Arc<dyn TenantHandler>) -> Self {
        Self {
            by_tenant: HashMap::new(),
            fallback,
        }
    }

    pub fn with_handler(mut self, tenant: &str, handler: Arc<dyn TenantHandler>) -> Self {
        self.by_tenant.insert(tenant.to_string(), handler);
        self
    }

    pub fn handler_for(&self, tenant: &str) -> Arc<dyn TenantHandler> {
        self.by_tenant
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(EchoHandler))
    }
}

/// Diagnostic handler: answers with a JSON summary of the routed request
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl TenantHandler for EchoHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a RoutedRequest,
        req: &'a mut RequestAdapter,
        res: &'a mut ResponseAdapter,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let summary = serde_json::json!({
                "tenant": ctx.tenant.name,
                "environment": ctx.tenant.environment,
                "method": req.method().as_str(),
                "host": ctx.host,
                "path": ctx.url.path,
                "query": ctx.url.query,
                "port": ctx.port,
                "protocol": ctx.protocol.as_str(),
                "request_id": ctx.request_id,
            });
            res.send_json(&summary)
                .map_err(|e| HandlerError::recoverable("failed to encode echo response").with_source(e))
        })
    }
}
