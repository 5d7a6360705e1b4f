// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests of the HTTP surface: status codes, polling headers, and error
//! bodies, exercised with a real client against a started server.

mod common;

use common::machine_body;
use common::test_config;
use common::test_logger;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use std::time::Instant;
use terrane_rp::Server;

const RESOURCE_PATH: &str = "/planes/terrane/local/resourceGroups/rg1/\
    providers/Terrane.Sim/machines/m1";
const API_VERSION_QUERY: &str = "api-version=2025-01-01";

struct TestServer {
    server: Server,
    client: reqwest::Client,
    base: String,
}

impl TestServer {
    async fn start() -> TestServer {
        let config = test_config();
        let log = test_logger();
        let server = Server::start(&config, log).await.unwrap();
        let base = format!("http://{}", server.local_addr());
        TestServer { server, client: reqwest::Client::new(), base }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?{}", self.base, path, API_VERSION_QUERY)
    }

    async fn put(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> reqwest::Response {
        self.client
            .put(self.url(path))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// Polls the Location header target from an accepted response until
    /// the operation completes (the endpoint answers 204).
    async fn wait_for_completion(&self, response: &reqwest::Response) {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .expect("accepted response carries a Location header")
            .to_str()
            .unwrap()
            .to_string();
        let url = format!("{}{}?{}", self.base, location, API_VERSION_QUERY);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let poll = self.client.get(&url).send().await.unwrap();
            match poll.status() {
                StatusCode::NO_CONTENT => return,
                StatusCode::ACCEPTED => {
                    assert!(poll
                        .headers()
                        .contains_key(reqwest::header::RETRY_AFTER));
                    assert!(poll
                        .headers()
                        .contains_key(reqwest::header::LOCATION));
                }
                other => panic!("unexpected poll status: {}", other),
            }
            assert!(
                Instant::now() < deadline,
                "operation did not complete in time"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn close(self) {
        self.server.close().await.unwrap();
    }
}

fn assert_async_headers(response: &reqwest::Response) {
    let headers = response.headers();
    assert!(headers.contains_key(reqwest::header::LOCATION));
    assert!(headers.contains_key("azure-asyncoperation"));
    assert_eq!(
        headers.get(reqwest::header::RETRY_AFTER).unwrap(),
        "60"
    );
    let location = headers.get(reqwest::header::LOCATION).unwrap();
    assert!(location.to_str().unwrap().contains("/operationresults/"));
    let async_operation = headers.get("azure-asyncoperation").unwrap();
    assert!(async_operation
        .to_str()
        .unwrap()
        .contains("/operationstatuses/"));
}

#[tokio::test]
async fn test_put_lifecycle_over_http() {
    let ts = TestServer::start().await;

    // Create: 201 with polling headers.
    let response = ts
        .put(RESOURCE_PATH, &machine_body(&[("vm", &["disk"]), ("disk", &[])]))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_async_headers(&response);

    // The status endpoint reports the operation.
    let async_operation = response
        .headers()
        .get("azure-asyncoperation")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let status: serde_json::Value = ts
        .client
        .get(format!("{}{}?{}", ts.base, async_operation, API_VERSION_QUERY))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(["Accepted", "Updating", "Succeeded"]
        .contains(&status["status"].as_str().unwrap()));

    ts.wait_for_completion(&response).await;

    // The resource is now readable and terminal.
    let response =
        ts.client.get(ts.url(RESOURCE_PATH)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["name"], "m1");
    assert_eq!(body["properties"]["provisioningState"], "Succeeded");
    assert_eq!(
        body["properties"]["status"]["outputResources"]
            .as_array()
            .unwrap()
            .len(),
        2
    );

    // Replacing a terminal resource: 202.
    let response = ts.put(RESOURCE_PATH, &machine_body(&[("disk", &[])])).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_async_headers(&response);
    ts.wait_for_completion(&response).await;

    ts.close().await;
}

#[tokio::test]
async fn test_delete_over_http() {
    let ts = TestServer::start().await;

    // Deleting a resource that never existed: 204, no operation.
    let response =
        ts.client.delete(ts.url(RESOURCE_PATH)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = ts.put(RESOURCE_PATH, &machine_body(&[("disk", &[])])).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    ts.wait_for_completion(&response).await;

    let response =
        ts.client.delete(ts.url(RESOURCE_PATH)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_async_headers(&response);
    ts.wait_for_completion(&response).await;

    let response =
        ts.client.get(ts.url(RESOURCE_PATH)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    ts.close().await;
}

#[tokio::test]
async fn test_conflicting_put_while_operation_runs() {
    let ts = TestServer::start().await;

    // Slow the deployment down so the second request races it reliably.
    let mut body = machine_body(&[("disk", &[])]);
    body["properties"]["simulate"] = json!({"createDelayMs": 500});
    let first = ts.put(RESOURCE_PATH, &body).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = ts.put(RESOURCE_PATH, &machine_body(&[("disk", &[])])).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let error: serde_json::Value = second.json().await.unwrap();
    assert_eq!(error["error_code"], "Conflict");

    ts.wait_for_completion(&first).await;
    ts.close().await;
}

#[tokio::test]
async fn test_patch_over_http() {
    let ts = TestServer::start().await;

    let mut body = machine_body(&[("disk", &[])]);
    body["properties"]["marker"] = json!("original");
    let response = ts.put(RESOURCE_PATH, &body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    ts.wait_for_completion(&response).await;

    let response = ts
        .client
        .patch(ts.url(RESOURCE_PATH))
        .json(&json!({"properties": {"extra": "added"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_async_headers(&response);
    ts.wait_for_completion(&response).await;

    let body: serde_json::Value = ts
        .client
        .get(ts.url(RESOURCE_PATH))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["properties"]["marker"], "original");
    assert_eq!(body["properties"]["extra"], "added");

    ts.close().await;
}

#[tokio::test]
async fn test_client_errors() {
    let ts = TestServer::start().await;

    // Malformed JSON body.
    let response = ts
        .client
        .put(ts.url(RESOURCE_PATH))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unregistered resource type.
    let response = ts
        .put(
            "/planes/terrane/local/resourceGroups/rg1/providers/\
             Unknown.Provider/widgets/w1",
            &json!({"properties": {}}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["error_code"], "BadRequest");

    // Invalid output-resource declaration fails before anything runs.
    let response = ts
        .put(
            RESOURCE_PATH,
            &json!({"properties": {"resources": [{"dependsOn": []}]}}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Reading a resource that does not exist.
    let response =
        ts.client.get(ts.url(RESOURCE_PATH)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["error_code"], "NotFound");

    // Polling an operation that does not exist.
    let response = ts
        .client
        .get(ts.url(
            "/planes/terrane/local/providers/Terrane.Sim/locations/global/\
             operationresults/aadc9982-82a9-445e-b0b9-152b5ee8f02c",
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    ts.close().await;
}

#[tokio::test]
async fn test_failed_operation_surfaces_error_details() {
    let ts = TestServer::start().await;

    let mut body = machine_body(&[("a", &["b"]), ("b", &["a"])]);
    body["properties"]["marker"] = json!("cycle");
    let response = ts.put(RESOURCE_PATH, &body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    ts.wait_for_completion(&response).await;

    let async_operation = response
        .headers()
        .get("azure-asyncoperation")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let status: serde_json::Value = ts
        .client
        .get(format!("{}{}?{}", ts.base, async_operation, API_VERSION_QUERY))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "Failed");
    assert_eq!(status["error"]["code"], "DependencyCycle");

    ts.close().await;
}
