//! Schema-driven validation and the typed-route helper.
//!
//! Path params, query params and decoded bodies deserialise into
//! `serde`-typed structs and then run their `validator` rules. Failures
//! surface as a 400 `SendError` carrying the rendered error tree.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use hyper::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::SendError;
use crate::state::{BodyData, BodyFormat, Flow, RequestState};

use super::node::{HandlerFuture, PathMatcher, RouteHandler, RouteNode, SecurityCheck};

fn validation_error(context: &str, details: serde_json::Value) -> SendError {
    SendError::bad_request(serde_json::json!({
        "in": context,
        "errors": details,
    }))
}

fn deserialize_checked<T: DeserializeOwned + Validate>(
    value: serde_json::Value,
    context: &str,
) -> Result<T, SendError> {
    let parsed: T = serde_json::from_value(value)
        .map_err(|err| validation_error(context, serde_json::Value::String(err.to_string())))?;
    parsed.validate().map_err(|errors| {
        let tree = serde_json::to_value(&errors)
            .unwrap_or_else(|_| serde_json::Value::String(errors.to_string()));
        validation_error(context, tree)
    })?;
    Ok(parsed)
}

/// Validates the path parameters against a typed schema.
pub fn check_path<T: DeserializeOwned + Validate>(
    state: &RequestState,
    context: &str,
) -> Result<T, SendError> {
    let mut object = serde_json::Map::new();
    for (name, value) in state.path_params() {
        object.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    deserialize_checked(serde_json::Value::Object(object), context)
}

/// Validates the query parameters against a typed schema.
///
/// Single-valued parameters deserialise as strings, repeated ones as arrays.
pub fn check_query<T: DeserializeOwned + Validate>(
    state: &RequestState,
    context: &str,
) -> Result<T, SendError> {
    let mut object = serde_json::Map::new();
    for (name, values) in state.query_params() {
        let value = if values.len() == 1 {
            serde_json::Value::String(values[0].clone())
        } else {
            serde_json::Value::Array(
                values
                    .iter()
                    .map(|v| serde_json::Value::String(v.clone()))
                    .collect(),
            )
        };
        object.insert(name.clone(), value);
    }
    deserialize_checked(serde_json::Value::Object(object), context)
}

/// Validates the prepared body against a typed schema, when one was decoded.
pub fn check_body<T: DeserializeOwned + Validate>(
    state: &RequestState,
    context: &str,
) -> Result<Option<T>, SendError> {
    let value = match state.data() {
        Some(BodyData::Json(value)) => value.clone(),
        Some(BodyData::UrlEncoded(map)) => {
            let mut object = serde_json::Map::new();
            for (name, value) in map {
                object.insert(name.clone(), serde_json::Value::String(value.clone()));
            }
            serde_json::Value::Object(object)
        }
        _ => return Ok(None),
    };
    deserialize_checked(value, context).map(Some)
}

/// Schema placeholder for routes without path, query or body inputs.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct EmptyParams {}

/// The typed inputs handed to a [`TypedRouteSpec`] implementation.
pub struct TypedInput<T: TypedRouteSpec + ?Sized> {
    pub path: T::PathParams,
    pub query: T::QueryParams,
    pub body: Option<T::Body>,
}

/// A compile-time-typed route descriptor.
///
/// The engine validates path, query and body against the declared schemas
/// before `handle` runs, validates the output afterwards, and serialises it
/// via `send_json`.
pub trait TypedRouteSpec: Send + Sync + 'static {
    type PathParams: DeserializeOwned + Validate + Send;
    type QueryParams: DeserializeOwned + Validate + Send;
    type Body: DeserializeOwned + Validate + Send;
    type Output: Serialize + Validate + Send + Sync;

    fn method() -> Method;
    fn matcher() -> PathMatcher;

    fn body_format() -> BodyFormat {
        BodyFormat::Ignore
    }

    fn security_checks() -> Vec<SecurityCheck> {
        vec![SecurityCheck::RequestedWithHeader]
    }

    /// HTTP status for a successful response.
    fn status() -> u16 {
        200
    }

    fn handle<'a>(
        state: &'a mut RequestState,
        input: TypedInput<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output, SendError>> + Send + 'a>>;
}

struct TypedHandler<T>(PhantomData<fn() -> T>);

impl<T: TypedRouteSpec> RouteHandler for TypedHandler<T> {
    fn call<'a>(&'a self, state: &'a mut RequestState) -> HandlerFuture<'a> {
        Box::pin(async move {
            let path = check_path::<T::PathParams>(state, "path")?;
            let query = check_query::<T::QueryParams>(state, "query")?;
            let body = check_body::<T::Body>(state, "body")?;
            let output = T::handle(state, TypedInput { path, query, body }).await?;
            output
                .validate()
                .map_err(|errors| SendError::internal(format!("invalid response: {}", errors)))?;
            let ended = state.send_json(T::status(), &output).await?;
            Ok(Flow::Done(ended))
        })
    }
}

/// Builds the route node for one typed route.
pub fn typed_route<T: TypedRouteSpec>() -> RouteNode {
    let mut node = RouteNode {
        matcher: T::matcher(),
        methods: vec![T::method()],
        body_formats: vec![T::body_format()],
        deny_final: false,
        security_checks: T::security_checks(),
        children: Vec::new(),
        handlers: Vec::new(),
        recovery: None,
    };
    node.handlers.push(std::sync::Arc::new(TypedHandler::<T>(PhantomData)));
    node
}

/// Installs one typed route under `parent`.
pub fn register_typed_route<T: TypedRouteSpec>(parent: &mut RouteNode) {
    parent.add_child(typed_route::<T>());
}

/// Installs several typed routes under one parent node.
#[macro_export]
macro_rules! register_typed_routes {
    ($parent:expr, $($route:ty),+ $(,)?) => {
        $( $crate::router::validation::register_typed_route::<$route>($parent); )+
    };
}
