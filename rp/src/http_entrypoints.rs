// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoints of the resource-provider API
//!
//! Endpoints stay thin: decode path and query parameters, call the
//! application layer, and translate its outcome into a response.  Several
//! endpoints answer with different status codes depending on the outcome
//! (201 vs 202, 202 vs 204), so those return a raw `http::Response`
//! rather than a typed dropshot response.

use crate::app::operation::AcceptedOperation;
use crate::app::operation::DeleteOutcome;
use crate::app::status::ResultPoll;
use crate::context::ServerContext;
use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::ApiDescriptionRegisterError;
use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::Path;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::UntypedBody;
use http::StatusCode;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use terrane_common::Error;
use terrane_common::ResourceId;
use uuid::Uuid;

type RpApiDescription = ApiDescription<Arc<ServerContext>>;

/// Return a description of the resource-provider API.
pub fn api() -> RpApiDescription {
    fn register_endpoints(
        api: &mut RpApiDescription,
    ) -> Result<(), ApiDescriptionRegisterError> {
        api.register(resource_put)?;
        api.register(resource_patch)?;
        api.register(resource_get)?;
        api.register(resource_delete)?;
        api.register(operation_status_get)?;
        api.register(operation_result_get)?;
        Ok(())
    }

    let mut api = RpApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ResourcePathParams {
    plane_type: String,
    plane_name: String,
    resource_group: String,
    provider: String,
    resource_type: String,
    resource_name: String,
}

impl ResourcePathParams {
    fn resource_id(&self) -> Result<ResourceId, HttpError> {
        let raw = format!(
            "/planes/{}/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.plane_type,
            self.plane_name,
            self.resource_group,
            self.provider,
            self.resource_type,
            self.resource_name,
        );
        raw.parse().map_err(|e: Error| HttpError::from(e))
    }
}

#[derive(Deserialize, JsonSchema)]
struct ApiVersionParam {
    #[serde(rename = "api-version")]
    api_version: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct OperationPathParams {
    plane_type: String,
    plane_name: String,
    provider: String,
    location: String,
    operation_id: Uuid,
}

impl OperationPathParams {
    fn tracking_id(&self, collection: &str) -> String {
        format!(
            "/planes/{}/{}/providers/{}/locations/{}/{}/{}",
            self.plane_type,
            self.plane_name,
            self.provider,
            self.location,
            collection,
            self.operation_id,
        )
    }
}

/// Create or replace a resource.  Asynchronous: answers 201 (created) or
/// 202 (updated) with polling headers.
#[endpoint {
    method = PUT,
    path = "/planes/{planeType}/{planeName}/resourceGroups/{resourceGroup}/providers/{provider}/{resourceType}/{resourceName}",
}]
async fn resource_put(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<ResourcePathParams>,
    query: Query<ApiVersionParam>,
    body: UntypedBody,
) -> Result<http::Response<dropshot::Body>, HttpError> {
    let ctx = rqctx.context();
    let id = path.into_inner().resource_id()?;
    let api_version = query.into_inner().api_version;
    let body = parse_body(&body)?;

    let accepted = ctx.controller.put(&id, &api_version, body).await?;
    accepted_response(&accepted)
}

/// Merge changes into an existing resource.  Asynchronous: answers 202.
#[endpoint {
    method = PATCH,
    path = "/planes/{planeType}/{planeName}/resourceGroups/{resourceGroup}/providers/{provider}/{resourceType}/{resourceName}",
}]
async fn resource_patch(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<ResourcePathParams>,
    query: Query<ApiVersionParam>,
    body: UntypedBody,
) -> Result<http::Response<dropshot::Body>, HttpError> {
    let ctx = rqctx.context();
    let id = path.into_inner().resource_id()?;
    let api_version = query.into_inner().api_version;
    let body = parse_body(&body)?;

    let accepted = ctx.controller.patch(&id, &api_version, body).await?;
    accepted_response(&accepted)
}

/// Fetch a resource.
#[endpoint {
    method = GET,
    path = "/planes/{planeType}/{planeName}/resourceGroups/{resourceGroup}/providers/{provider}/{resourceType}/{resourceName}",
}]
async fn resource_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<ResourcePathParams>,
    query: Query<ApiVersionParam>,
) -> Result<HttpResponseOk<serde_json::Value>, HttpError> {
    let ctx = rqctx.context();
    let id = path.into_inner().resource_id()?;
    let api_version = query.into_inner().api_version;
    let body = ctx.controller.get(&id, &api_version).await?;
    Ok(HttpResponseOk(body))
}

/// Delete a resource.  Asynchronous: answers 202 with polling headers, or
/// 204 when the resource does not exist.
#[endpoint {
    method = DELETE,
    path = "/planes/{planeType}/{planeName}/resourceGroups/{resourceGroup}/providers/{provider}/{resourceType}/{resourceName}",
}]
async fn resource_delete(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<ResourcePathParams>,
    query: Query<ApiVersionParam>,
) -> Result<http::Response<dropshot::Body>, HttpError> {
    let ctx = rqctx.context();
    let id = path.into_inner().resource_id()?;
    let api_version = query.into_inner().api_version;

    match ctx.controller.delete(&id, &api_version).await? {
        DeleteOutcome::NoOp => empty_response(StatusCode::NO_CONTENT),
        DeleteOutcome::Accepted(accepted) => accepted_response(&accepted),
    }
}

/// Poll the status of an asynchronous operation.
#[endpoint {
    method = GET,
    path = "/planes/{planeType}/{planeName}/providers/{provider}/locations/{location}/operationstatuses/{operationId}",
}]
async fn operation_status_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<OperationPathParams>,
    _query: Query<ApiVersionParam>,
) -> Result<HttpResponseOk<serde_json::Value>, HttpError> {
    let ctx = rqctx.context();
    let status_id = path.into_inner().tracking_id("operationstatuses");
    let status = ctx.status.get(&status_id).await?;
    let body = serde_json::to_value(&status)
        .map_err(|e| HttpError::for_internal_error(e.to_string()))?;
    Ok(HttpResponseOk(body))
}

/// Poll the result of an asynchronous operation: 202 with polling headers
/// while it runs, 204 once it is terminal.
#[endpoint {
    method = GET,
    path = "/planes/{planeType}/{planeName}/providers/{provider}/locations/{location}/operationresults/{operationId}",
}]
async fn operation_result_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<OperationPathParams>,
    _query: Query<ApiVersionParam>,
) -> Result<http::Response<dropshot::Body>, HttpError> {
    let ctx = rqctx.context();
    let params = path.into_inner();
    // The status record is shared between both tracking endpoints.
    let status_id = params.tracking_id("operationstatuses");
    match ctx.status.get_result(&status_id).await? {
        ResultPoll::Complete => empty_response(StatusCode::NO_CONTENT),
        ResultPoll::InProgress { retry_after_secs } => {
            let response = http::Response::builder()
                .status(StatusCode::ACCEPTED)
                .header(
                    http::header::LOCATION,
                    params.tracking_id("operationresults"),
                )
                .header(http::header::RETRY_AFTER, retry_after_secs)
                .body(dropshot::Body::empty())
                .map_err(|e| {
                    HttpError::for_internal_error(e.to_string())
                })?;
            Ok(response)
        }
    }
}

fn parse_body(body: &UntypedBody) -> Result<serde_json::Value, HttpError> {
    serde_json::from_slice(body.as_bytes()).map_err(|e| {
        HttpError::from(Error::invalid_request(format!(
            "request body is not valid JSON: {}",
            e
        )))
    })
}

fn accepted_response(
    accepted: &AcceptedOperation,
) -> Result<http::Response<dropshot::Body>, HttpError> {
    let status = if accepted.created {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    let body = match &accepted.body {
        Some(body) => {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| HttpError::for_internal_error(e.to_string()))?;
            dropshot::Body::with_content(bytes)
        }
        None => dropshot::Body::empty(),
    };
    let response = http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::LOCATION, &accepted.result_path)
        .header("azure-asyncoperation", &accepted.status_path)
        .header(http::header::RETRY_AFTER, accepted.retry_after_secs)
        .body(body)
        .map_err(|e| HttpError::for_internal_error(e.to_string()))?;
    Ok(response)
}

fn empty_response(
    status: StatusCode,
) -> Result<http::Response<dropshot::Body>, HttpError> {
    http::Response::builder()
        .status(status)
        .body(dropshot::Body::empty())
        .map_err(|e| HttpError::for_internal_error(e.to_string()))
}
