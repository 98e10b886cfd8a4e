//! Lifecycle tests for the Nova backend against a fake compute endpoint

use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use shoes_provider::config::OpenStackConfig;
use shoes_provider::mapping::{self, ResourceMap};
use shoes_provider::providers::OpenStackShoes;
use shoes_provider::{AddInstanceRequest, ResourceTier, ShoesProvider};

const RUNNER: &str = "2f1f788d-5d33-4f27-b3a1-6f7b51f4a0d4";
const SERVER_ID: &str = "a4f1c3d5-9b7e-4c21-8d6f-0e5a2b9c7d18";
const TOKEN: &str = "gAAAAABk-test-token";

fn shoes_over(server: &ServerGuard, mapping: ResourceMap<String>) -> OpenStackShoes {
    OpenStackShoes::with_endpoint(
        reqwest::Client::new(),
        server.url(),
        TOKEN.to_string(),
        OpenStackConfig {
            auth_url: "http://keystone.example/v3".to_string(),
            username: "ci".to_string(),
            password: "secret".to_string(),
            project_name: "runners".to_string(),
            user_domain_name: "Default".to_string(),
            flavor_id: "flavor-default".to_string(),
            image_id: "image-1".to_string(),
            network_id: "net-1".to_string(),
            region_name: None,
            mapping,
        },
    )
}

fn add_request() -> AddInstanceRequest {
    AddInstanceRequest {
        runner_name: RUNNER.to_string(),
        setup_script: "echo 0".to_string(),
        resource_type: ResourceTier::Nano,
    }
}

#[tokio::test]
async fn test_create_boots_and_waits_for_active() {
    let mut server = Server::new_async().await;

    let create = server
        .mock("POST", "/servers")
        .match_header("x-auth-token", TOKEN)
        .match_body(Matcher::PartialJson(json!({
            "server": {
                "name": RUNNER,
                "flavorRef": "flavor-nano",
                "imageRef": "image-1",
                "networks": [{"uuid": "net-1"}],
                // base64 of "echo 0"
                "user_data": "ZWNobyAw"
            }
        })))
        .with_status(202)
        .with_body(json!({"server": {"id": SERVER_ID}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let poll = server
        .mock("GET", format!("/servers/{}", SERVER_ID).as_str())
        .match_header("x-auth-token", TOKEN)
        .with_body(
            json!({
                "server": {"id": SERVER_ID, "status": "ACTIVE", "accessIPv4": "203.0.113.5"}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let mapping = mapping::parse_flat_mapping(
        "OS_RESOURCE_TYPE_MAPPING",
        r#"{"nano": "flavor-nano"}"#,
    )
    .unwrap();
    let shoes = shoes_over(&server, mapping);
    let detail = shoes.add_instance(add_request()).await.unwrap();

    assert_eq!(detail.cloud_id, SERVER_ID);
    assert_eq!(detail.shoes_type, "openstack");
    assert_eq!(detail.ip_address, "203.0.113.5");
    create.assert_async().await;
    poll.assert_async().await;
}

#[tokio::test]
async fn test_create_uses_default_flavor_when_unmapped() {
    let mut server = Server::new_async().await;

    let create = server
        .mock("POST", "/servers")
        .match_body(Matcher::PartialJson(
            json!({"server": {"flavorRef": "flavor-default"}}),
        ))
        .with_status(202)
        .with_body(json!({"server": {"id": SERVER_ID}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let _poll = server
        .mock("GET", format!("/servers/{}", SERVER_ID).as_str())
        .with_body(json!({"server": {"id": SERVER_ID, "status": "ACTIVE"}}).to_string())
        .create_async()
        .await;

    let shoes = shoes_over(&server, ResourceMap::empty());
    let detail = shoes.add_instance(add_request()).await.unwrap();

    assert_eq!(detail.cloud_id, SERVER_ID);
    create.assert_async().await;
}

#[tokio::test]
async fn test_create_fails_when_server_enters_error_state() {
    let mut server = Server::new_async().await;

    let _create = server
        .mock("POST", "/servers")
        .with_status(202)
        .with_body(json!({"server": {"id": SERVER_ID}}).to_string())
        .create_async()
        .await;
    let _poll = server
        .mock("GET", format!("/servers/{}", SERVER_ID).as_str())
        .with_body(json!({"server": {"id": SERVER_ID, "status": "ERROR"}}).to_string())
        .create_async()
        .await;

    let shoes = shoes_over(&server, ResourceMap::empty());
    let err = shoes.add_instance(add_request()).await.unwrap_err();

    assert_eq!(err.status_code(), "internal");
    assert!(err.to_string().contains("ERROR state"));
}

#[tokio::test]
async fn test_create_rejects_malformed_runner_name() {
    let server = Server::new_async().await;
    let shoes = shoes_over(&server, ResourceMap::empty());
    let err = shoes
        .add_instance(AddInstanceRequest {
            runner_name: "runner-1".to_string(),
            ..add_request()
        })
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), "invalid_argument");
}

#[tokio::test]
async fn test_delete_removes_and_waits_until_gone() {
    let mut server = Server::new_async().await;

    let delete = server
        .mock("DELETE", format!("/servers/{}", SERVER_ID).as_str())
        .match_header("x-auth-token", TOKEN)
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let poll = server
        .mock("GET", format!("/servers/{}", SERVER_ID).as_str())
        .with_status(404)
        .create_async()
        .await;

    let shoes = shoes_over(&server, ResourceMap::empty());
    shoes.delete_instance(SERVER_ID).await.unwrap();

    delete.assert_async().await;
    poll.assert_async().await;
}

#[tokio::test]
async fn test_delete_unknown_server_is_invalid_argument() {
    let mut server = Server::new_async().await;

    let _delete = server
        .mock("DELETE", format!("/servers/{}", SERVER_ID).as_str())
        .with_status(404)
        .create_async()
        .await;

    let shoes = shoes_over(&server, ResourceMap::empty());
    let err = shoes.delete_instance(SERVER_ID).await.unwrap_err();

    assert_eq!(err.status_code(), "invalid_argument");
    assert!(err.to_string().contains(SERVER_ID));
}

#[tokio::test]
async fn test_startup_resolves_compute_endpoint_for_configured_region() {
    let mut server = Server::new_async().await;

    let catalog = json!({
        "token": {
            "catalog": [{
                "type": "compute",
                "endpoints": [
                    {"interface": "public", "region": "RegionOne",
                     "url": format!("{}/region-one", server.url())},
                    {"interface": "public", "region": "RegionTwo",
                     "url": format!("{}/region-two", server.url())}
                ]
            }]
        }
    });
    let auth = server
        .mock("POST", "/auth/tokens")
        .match_body(Matcher::PartialJson(json!({
            "auth": {"identity": {"methods": ["password"]}}
        })))
        .with_status(201)
        .with_header("x-subject-token", TOKEN)
        .with_body(catalog.to_string())
        .expect(1)
        .create_async()
        .await;
    // Lifecycle calls must land on the configured region's Nova
    let delete = server
        .mock("DELETE", format!("/region-two/servers/{}", SERVER_ID).as_str())
        .match_header("x-auth-token", TOKEN)
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let _poll = server
        .mock("GET", format!("/region-two/servers/{}", SERVER_ID).as_str())
        .with_status(404)
        .create_async()
        .await;
    let wrong_region = server
        .mock("DELETE", format!("/region-one/servers/{}", SERVER_ID).as_str())
        .expect(0)
        .create_async()
        .await;

    let shoes = OpenStackShoes::new(OpenStackConfig {
        auth_url: server.url(),
        username: "ci".to_string(),
        password: "secret".to_string(),
        project_name: "runners".to_string(),
        user_domain_name: "Default".to_string(),
        flavor_id: "flavor-default".to_string(),
        image_id: "image-1".to_string(),
        network_id: "net-1".to_string(),
        region_name: Some("RegionTwo".to_string()),
        mapping: ResourceMap::empty(),
    })
    .await
    .unwrap();
    shoes.delete_instance(SERVER_ID).await.unwrap();

    auth.assert_async().await;
    delete.assert_async().await;
    wrong_region.assert_async().await;
}

#[tokio::test]
async fn test_startup_fails_when_region_missing_from_catalog() {
    let mut server = Server::new_async().await;

    let _auth = server
        .mock("POST", "/auth/tokens")
        .with_status(201)
        .with_header("x-subject-token", TOKEN)
        .with_body(
            json!({
                "token": {
                    "catalog": [{
                        "type": "compute",
                        "endpoints": [{"interface": "public", "region": "RegionOne",
                                       "url": "http://nova-one.example/v2.1"}]
                    }]
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let err = OpenStackShoes::new(OpenStackConfig {
        auth_url: server.url(),
        username: "ci".to_string(),
        password: "secret".to_string(),
        project_name: "runners".to_string(),
        user_domain_name: "Default".to_string(),
        flavor_id: "flavor-default".to_string(),
        image_id: "image-1".to_string(),
        network_id: "net-1".to_string(),
        region_name: Some("RegionTwo".to_string()),
        mapping: ResourceMap::empty(),
    })
    .await
    .unwrap_err();

    assert_eq!(err.status_code(), "internal");
    assert!(err.to_string().contains("RegionTwo"));
}

#[tokio::test]
async fn test_delete_rejects_non_uuid_id() {
    // Never touches the endpoint: no mocks mounted
    let server = Server::new_async().await;
    let shoes = shoes_over(&server, ResourceMap::empty());
    let err = shoes.delete_instance("i-1234567890abcdef0").await.unwrap_err();
    assert_eq!(err.status_code(), "invalid_argument");
}
