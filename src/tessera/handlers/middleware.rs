use crate::session::{RequestContext, SessionManager};
use axum::{extract::Request, middleware::Next, response::Response, Extension};
use std::sync::Arc;

/// Resolve the bearer token once and attach the result as an
/// [`AuthInfo`](crate::session::AuthInfo) extension. Requests without a token
/// pass through untouched.
pub async fn resolve_auth_info(
    Extension(manager): Extension<Arc<SessionManager>>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = RequestContext::from_headers(request.headers());
    if context.bearer().is_some() {
        let info = manager.resolve_bearer(&context).await;
        request.extensions_mut().insert(info);
    }
    next.run(request).await
}
