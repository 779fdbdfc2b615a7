//! Per-request routing: host and URL validation, tenant resolution,
//! canonical redirects and dispatch to the tenant handler.

use crate::adapter::{RequestAdapter, RequestBody, ResponseAdapter, ResponseBody, ResponseReceiver};
use crate::error::Rejection;
use crate::events::{Event, EventBus, EventKind, Severity};
use crate::handler::{HandlerError, HandlerRegistry, RoutedRequest, TenantHandler};
use crate::tenant::{CanonicalLocation, Protocol, Tenant, TenantResolver};
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// A request path that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    /// Path and query exactly as received
    pub raw: String,
    pub path: String,
    pub query: Option<String>,
    /// `path` with percent-escapes decoded
    pub decoded_path: String,
}

/// Why a request path was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidUrl {
    DisallowedCharacter(char),
    MalformedEscape,
    NotUtf8,
}

impl RequestUrl {
    /// Only `[A-Za-z0-9_.-/?=%]` is accepted, and every escape must decode
    /// to valid UTF-8.
    pub fn parse(raw: &str) -> Result<Self, InvalidUrl> {
        if let Some(c) = raw.chars().find(|c| !is_allowed_url_char(*c)) {
            return Err(InvalidUrl::DisallowedCharacter(c));
        }
        percent_decode(raw)?;

        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (raw, None),
        };
        let path = if path.is_empty() { "/" } else { path };
        let decoded_path = percent_decode(path)?;

        Ok(Self {
            raw: raw.to_string(),
            path: path.to_string(),
            query,
            decoded_path,
        })
    }
}

fn is_allowed_url_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | '?' | '=' | '%')
}

fn percent_decode(raw: &str) -> Result<String, InvalidUrl> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .map(|pair| pair.iter().all(u8::is_ascii_hexdigit))
                .unwrap_or(false);
            if !valid {
                return Err(InvalidUrl::MalformedEscape);
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| InvalidUrl::NotUtf8)
}

/// Host from the Host header (or the HTTP/2 authority), port stripped,
/// lower-cased. `None` when absent, empty or not a plausible hostname.
pub fn extract_host<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.headers().get(header::HOST) {
        Some(value) => value.to_str().ok()?,
        None => req.uri().authority()?.as_str(),
    };
    let raw = raw.trim();

    let hostname = if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal
        let end = rest.find(']')?;
        &raw[..end + 2]
    } else {
        raw.split(':').next()?
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if hostname.chars().any(|c| c.is_ascii_control() || c.is_whitespace()) {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// `Location` for a request that does not match its tenant's canonical
/// host and port, or `None` when it already does. The port is omitted when
/// it is 80 or 443.
pub fn redirect_location(
    canonical: &CanonicalLocation,
    host: &str,
    port: u16,
    url: &RequestUrl,
) -> Option<String> {
    let target_host = canonical.host.as_deref().unwrap_or(host);
    let target_port = canonical.port.unwrap_or(port);

    if target_host == host && target_port == port {
        return None;
    }

    let authority = if target_port == 80 || target_port == 443 {
        target_host.to_string()
    } else {
        format!("{}:{}", target_host, target_port)
    };

    Some(format!("{}://{}{}", canonical.protocol, authority, url.raw))
}

/// Routes requests for one listener
#[derive(Clone)]
pub struct Router {
    resolver: Arc<dyn TenantResolver>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    protocol: Protocol,
    default_server_identity: Arc<str>,
    max_body_bytes: usize,
}

impl Router {
    pub fn new(
        resolver: Arc<dyn TenantResolver>,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
        protocol: Protocol,
        default_server_identity: &str,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            resolver,
            handlers,
            events,
            protocol,
            default_server_identity: Arc::from(default_server_identity),
            max_body_bytes,
        }
    }

    /// Route one request that arrived on `local_port`. Always produces a
    /// response; failures are converted to 4xx/5xx here.
    pub async fn route(&self, req: Request<RequestBody>, local_port: u16) -> Response<ResponseBody> {
        let method = req.method().clone();

        let host = match extract_host(&req) {
            Some(host) => host,
            None => {
                warn!(port = local_port, protocol = %self.protocol, "Rejecting request with invalid Host header");
                return self.reject(method, &self.default_server_identity, Rejection::InvalidHost).await;
            }
        };

        let raw_url = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = match RequestUrl::parse(raw_url) {
            Ok(url) => url,
            Err(reason) => {
                warn!(host, port = local_port, reason = ?reason, "Rejecting request with invalid URL");
                return self.reject(method, &self.default_server_identity, Rejection::InvalidUrl).await;
            }
        };

        let tenant = match self.resolver.resolve_tenant(&host, local_port) {
            Some(tenant) => tenant,
            None => {
                info!(host, port = local_port, "Host not found");
                return self.reject(method, &self.default_server_identity, Rejection::HostNotFound).await;
            }
        };

        let server_identity = tenant
            .server_identity
            .clone()
            .unwrap_or_else(|| self.default_server_identity.to_string());

        if let Some(location) = redirect_location(&tenant.canonical_location(), &host, local_port, &url) {
            debug!(tenant = %tenant.name, host, port = local_port, location, "Redirecting to canonical location");
            return self.redirect(method, &server_identity, &location).await;
        }

        let ctx = RoutedRequest {
            tenant,
            url,
            host,
            port: local_port,
            protocol: self.protocol,
            request_id: Uuid::new_v4().to_string(),
        };
        self.dispatch(req, ctx, &server_identity).await
    }

    async fn reject(&self, method: Method, server_identity: &str, rejection: Rejection) -> Response<ResponseBody> {
        let (mut res, rx) = ResponseAdapter::new(method, server_identity);
        res.set_status(rejection.status_code());
        res.send_text(rejection.body());
        finish(rx).await
    }

    async fn redirect(&self, method: Method, server_identity: &str, location: &str) -> Response<ResponseBody> {
        let value = match HeaderValue::from_str(location) {
            Ok(value) => value,
            Err(e) => {
                error!(location, error = %e, "Canonical location is not a valid header value");
                return self.reject(method, server_identity, Rejection::Internal).await;
            }
        };
        let (mut res, rx) = ResponseAdapter::new(method, server_identity);
        res.set_status(StatusCode::MOVED_PERMANENTLY);
        res.set_header(header::LOCATION, value);
        res.end();
        finish(rx).await
    }

    /// Run the tenant handler on its own task so a streaming body keeps
    /// flowing after the head has been returned to the connection.
    async fn dispatch(&self, req: Request<RequestBody>, ctx: RoutedRequest, server_identity: &str) -> Response<ResponseBody> {
        let handler = self.handlers.handler_for(&ctx.tenant.name);
        let mut request = RequestAdapter::new(req, self.max_body_bytes);
        let (mut res, rx) = ResponseAdapter::new(request.method().clone(), server_identity);
        let events = self.events.clone();

        debug!(
            tenant = %ctx.tenant.name,
            request_id = %ctx.request_id,
            method = %request.method(),
            url = %ctx.url.raw,
            "Dispatching request"
        );

        tokio::spawn(async move {
            match run_handler(handler.as_ref(), &ctx, &mut request, &mut res).await {
                Ok(()) => res.end(),
                Err(err) => {
                    res.fail();
                    report_failure(&events, &ctx, &err);
                }
            }
        });

        finish(rx).await
    }
}

/// Await the handler with panics converted into fatal errors
async fn run_handler(
    handler: &dyn TenantHandler,
    ctx: &RoutedRequest,
    req: &mut RequestAdapter,
    res: &mut ResponseAdapter,
) -> Result<(), HandlerError> {
    let outcome = AssertUnwindSafe(async { handler.handle(ctx, req, res).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::panicked(&message))
        }
    }
}

fn report_failure(events: &EventBus, ctx: &RoutedRequest, err: &HandlerError) {
    let severity = if err.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Warning
    };
    error!(
        tenant = %ctx.tenant.name,
        request_id = %ctx.request_id,
        url = %ctx.url.raw,
        fatal = err.is_fatal(),
        error = %err,
        "Tenant handler failed"
    );
    let mut event = Event::new(EventKind::DispatchFailure, severity, "tenant handler failed")
        .with_cause(err)
        .with_info("tenant", &ctx.tenant.name)
        .with_info("request_id", &ctx.request_id)
        .with_info("url", &ctx.url.raw);
    if let Some(source) = std::error::Error::source(err) {
        event = event.with_info("source", source);
    }
    events.publish(event);
}

async fn finish(rx: ResponseReceiver) -> Response<ResponseBody> {
    match rx.recv().await {
        Ok(response) => response,
        Err(_) => {
            // Writer vanished without committing a head
            Response::builder()
                .status(Rejection::Internal.status_code())
                .header(header::CONTENT_TYPE, crate::adapter::TEXT_PLAIN)
                .body(
                    Full::new(Bytes::from_static(Rejection::Internal.body().as_bytes()))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid response with StatusCode enum and static headers")
        }
    }
}

/// `scheme://host:port` summary of a tenant's canonical location, `*` for
/// parts the tenant leaves open
pub fn describe_canonical(tenant: &Tenant) -> String {
    let location = tenant.canonical_location();
    format!(
        "{}://{}:{}",
        location.protocol,
        location.host.as_deref().unwrap_or("*"),
        location
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "*".to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::request_body;
    use crate::config::{ListenerConfig, TenantConfig};
    use crate::tenant::VirtualHostIndex;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        inner: VirtualHostIndex,
        calls: AtomicUsize,
    }

    impl TenantResolver for CountingResolver {
        fn resolve_tenant(&self, hostname: &str, port: u16) -> Option<Arc<Tenant>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(hostname, port)
        }
    }

    enum Behavior {
        Text(&'static str),
        Nothing,
        FailFatal,
        FailRecoverable,
        Panic,
        StartThenFail,
    }

    struct TestHandler(Behavior);

    impl TenantHandler for TestHandler {
        fn handle<'a>(
            &'a self,
            ctx: &'a RoutedRequest,
            _req: &'a mut RequestAdapter,
            res: &'a mut ResponseAdapter,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async move {
                match self.0 {
                    Behavior::Text(text) => {
                        res.send_text(format!("{} {}", text, ctx.tenant.name));
                        Ok(())
                    }
                    Behavior::Nothing => Ok(()),
                    Behavior::FailFatal => Err(HandlerError::fatal("database unreachable")),
                    Behavior::FailRecoverable => Err(HandlerError::recoverable("bad form")),
                    Behavior::Panic => panic!("handler exploded"),
                    Behavior::StartThenFail => {
                        res.write(Bytes::from("partial")).await;
                        Err(HandlerError::recoverable("stream broke"))
                    }
                }
            })
        }
    }

    fn listeners() -> Vec<ListenerConfig> {
        vec![
            ListenerConfig::plain(80),
            ListenerConfig::encrypted(443),
            ListenerConfig::plain(8080),
        ]
    }

    fn tenants() -> Vec<TenantConfig> {
        vec![
            TenantConfig::new("example")
                .with_ports(&[443])
                .with_hostname("example.com", "example")
                .with_hostname("www.example.com", "example")
                .with_server_identity("example-site"),
            TenantConfig::new("plain")
                .with_ports(&[8080])
                .with_hostname("plain.test", "plain"),
            TenantConfig::new("catchall").with_ports(&[80]),
        ]
    }

    fn resolver() -> Arc<CountingResolver> {
        Arc::new(CountingResolver {
            inner: VirtualHostIndex::from_config(&tenants(), &listeners()),
            calls: AtomicUsize::new(0),
        })
    }

    fn router_with(resolver: Arc<CountingResolver>, behavior: Behavior, protocol: Protocol) -> (Router, EventBus) {
        let events = EventBus::new();
        let handlers = HandlerRegistry::new(Arc::new(TestHandler(behavior)));
        let router = Router::new(resolver, Arc::new(handlers), events.clone(), protocol, "hostgate-test", 1024);
        (router, events)
    }

    fn router(behavior: Behavior, protocol: Protocol) -> (Router, EventBus) {
        router_with(resolver(), behavior, protocol)
    }

    fn get(uri: &str, host: Option<&str>) -> Request<RequestBody> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(request_body(b"")).unwrap()
    }

    async fn body_string(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_url_allow_list() {
        assert!(RequestUrl::parse("/foo/bar-baz_1.html?x=1").is_ok());
        assert!(RequestUrl::parse("/a%20b").is_ok());
        assert_eq!(
            RequestUrl::parse("/a b"),
            Err(InvalidUrl::DisallowedCharacter(' '))
        );
        assert_eq!(
            RequestUrl::parse("/x?a=1&b=2"),
            Err(InvalidUrl::DisallowedCharacter('&'))
        );
        assert!(RequestUrl::parse("/<script>").is_err());
        assert!(RequestUrl::parse("/~user").is_err());
    }

    #[test]
    fn test_url_percent_decoding() {
        assert_eq!(RequestUrl::parse("/%zz"), Err(InvalidUrl::MalformedEscape));
        assert_eq!(RequestUrl::parse("/trailing%"), Err(InvalidUrl::MalformedEscape));
        assert_eq!(RequestUrl::parse("/%4"), Err(InvalidUrl::MalformedEscape));
        assert_eq!(RequestUrl::parse("/%ff"), Err(InvalidUrl::NotUtf8));

        let url = RequestUrl::parse("/caf%C3%A9?q=%3D").unwrap();
        assert_eq!(url.path, "/caf%C3%A9");
        assert_eq!(url.decoded_path, "/café");
        assert_eq!(url.query.as_deref(), Some("q=%3D"));
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host(&get("/", Some("Example.COM:8080"))).as_deref(), Some("example.com"));
        assert_eq!(extract_host(&get("/", Some("example.com"))).as_deref(), Some("example.com"));
        assert_eq!(extract_host(&get("/", Some("[::1]:443"))).as_deref(), Some("[::1]"));
        assert_eq!(extract_host(&get("/", Some(""))), None);
        assert_eq!(extract_host(&get("/", Some(":80"))), None);
        assert_eq!(extract_host(&get("/", None)), None);
        assert_eq!(
            extract_host(&get("http://authority.test:81/", None)).as_deref(),
            Some("authority.test")
        );
    }

    #[test]
    fn test_redirect_port_omission() {
        let url = RequestUrl::parse("/foo?x=1").unwrap();
        let https = CanonicalLocation {
            host: Some("example.com".to_string()),
            port: Some(443),
            protocol: Protocol::Https,
        };
        assert_eq!(
            redirect_location(&https, "example.com", 80, &url).as_deref(),
            Some("https://example.com/foo?x=1")
        );
        assert_eq!(redirect_location(&https, "example.com", 443, &url), None);

        let custom = CanonicalLocation {
            host: Some("example.com".to_string()),
            port: Some(8443),
            protocol: Protocol::Https,
        };
        assert_eq!(
            redirect_location(&custom, "www.example.com", 8443, &url).as_deref(),
            Some("https://example.com:8443/foo?x=1")
        );

        let http80 = CanonicalLocation {
            host: Some("plain.test".to_string()),
            port: Some(80),
            protocol: Protocol::Http,
        };
        assert_eq!(
            redirect_location(&http80, "alias.test", 80, &url).as_deref(),
            Some("http://plain.test/foo?x=1")
        );
    }

    #[test]
    fn test_redirect_without_canonical_host_or_port() {
        let url = RequestUrl::parse("/").unwrap();
        let bare = CanonicalLocation {
            host: None,
            port: None,
            protocol: Protocol::Http,
        };
        assert_eq!(redirect_location(&bare, "anything.test", 8080, &url), None);
    }

    #[tokio::test]
    async fn test_missing_host_is_400_without_resolving() {
        let resolver = resolver();
        let (router, _) = router_with(Arc::clone(&resolver), Behavior::Text("hi"), Protocol::Http);

        for host in [None, Some(""), Some(" ")] {
            let response = router.route(get("/", host), 80).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(response.headers()[header::SERVER], "hostgate-test");
            assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=UTF-8");
            assert_eq!(body_string(response).await, "Bad Request: Invalid host request header\n");
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_is_400() {
        let resolver = resolver();
        let (router, _) = router_with(Arc::clone(&resolver), Behavior::Text("hi"), Protocol::Https);
        for uri in ["/a%zz", "/x?a=1&b=2", "/~root", "/%ff"] {
            let response = router.route(get(uri, Some("example.com")), 443).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body_string(response).await, "Bad Request: Invalid URL\n");
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_host_is_404() {
        let (router, _) = router(Behavior::Text("hi"), Protocol::Http);
        let response = router.route(get("/", Some("bogus.internal")), 8080).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::SERVER], "hostgate-test");
        assert_eq!(body_string(response).await, "Not Found: Host not found\n");
    }

    #[tokio::test]
    async fn test_plain_request_upgraded_to_https() {
        let (router, _) = router(Behavior::Text("hi"), Protocol::Http);
        let response = router.route(get("/foo?x=1", Some("example.com:80")), 80).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://example.com/foo?x=1");
        assert_eq!(response.headers()[header::SERVER], "example-site");
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_alias_host_redirected_to_canonical() {
        let (router, _) = router(Behavior::Text("hi"), Protocol::Https);
        let response = router.route(get("/a/b", Some("www.example.com")), 443).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://example.com/a/b");
    }

    #[tokio::test]
    async fn test_canonical_request_dispatched() {
        let (router, _) = router(Behavior::Text("hello"), Protocol::Https);
        let response = router.route(get("/", Some("example.com")), 443).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::SERVER], "example-site");
        assert_eq!(body_string(response).await, "hello example");
    }

    #[tokio::test]
    async fn test_non_default_canonical_port_kept_in_location() {
        let (router, _) = router(Behavior::Text("hi"), Protocol::Http);
        let response = router.route(get("/p", Some("plain.test")), 80).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "http://plain.test:8080/p");
    }

    #[tokio::test]
    async fn test_catch_all_tenant_dispatched_without_redirect() {
        let (router, _) = router(Behavior::Text("fallback"), Protocol::Http);
        let response = router.route(get("/", Some("whatever.test")), 80).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::SERVER], "hostgate-test");
        assert_eq!(body_string(response).await, "fallback catchall");
    }

    #[tokio::test]
    async fn test_handler_that_never_ends_is_ended() {
        let (router, _) = router(Behavior::Nothing, Protocol::Http);
        let response = router.route(get("/", Some("anything")), 80).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "0");
    }

    #[tokio::test]
    async fn test_fatal_handler_error_is_500_and_fatal_event() {
        let (router, events) = router(Behavior::FailFatal, Protocol::Http);
        let mut rx = events.subscribe();
        let response = router.route(get("/x", Some("anything")), 80).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Server Error: Unexpected server error\n");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::DispatchFailure);
        assert_eq!(event.severity, Severity::Fatal);
        assert_eq!(event.info.get("tenant").map(String::as_str), Some("catchall"));
        assert_eq!(event.cause.as_deref(), Some("database unreachable"));
    }

    #[tokio::test]
    async fn test_recoverable_handler_error_is_warning() {
        let (router, events) = router(Behavior::FailRecoverable, Protocol::Http);
        let mut rx = events.subscribe();
        let response = router.route(get("/", Some("anything")), 80).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(rx.recv().await.unwrap().severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let (router, events) = router(Behavior::Panic, Protocol::Http);
        let mut rx = events.subscribe();
        let response = router.route(get("/", Some("anything")), 80).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let event = rx.recv().await.unwrap();
        assert!(event.is_fatal());
        assert!(event.cause.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_failure_after_headers_keeps_status() {
        let (router, events) = router(Behavior::StartThenFail, Protocol::Http);
        let mut rx = events.subscribe();
        let response = router.route(get("/", Some("anything")), 80).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "partial");
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::DispatchFailure);
    }

    #[tokio::test]
    async fn test_head_rejection_has_no_body() {
        let (router, _) = router(Behavior::Text("hi"), Protocol::Http);
        let req = Request::builder()
            .method(Method::HEAD)
            .uri("/")
            .header(header::HOST, "bogus.internal")
            .body(request_body(b""))
            .unwrap();
        let response = router.route(req, 8080).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "26");
        assert_eq!(body_string(response).await, "");
    }

    #[test]
    fn test_describe_canonical() {
        let index = VirtualHostIndex::from_config(&tenants(), &listeners());
        let example = index.resolve("example.com", 443).unwrap();
        assert_eq!(describe_canonical(&example), "https://example.com:443");
        let catchall = index.resolve("x", 80).unwrap();
        assert_eq!(describe_canonical(&catchall), "http://*:80");
    }
}
