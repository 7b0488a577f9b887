use chrono::{TimeZone, Utc};
use serde_json::json;
use srsmail::arcgis::{ArcGisClient, FeatureSource, ItemData, PortalContent, RecordSource};
use srsmail::config;
use srsmail::model::Window;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVICE_PATH: &str = "/arcgis/rest/services/SRS/FeatureServer";

async fn mount_sign_in(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/sharing/rest/generateToken"))
        .and(body_string_contains("username=gss_service"))
        .and(body_string_contains("password=change-me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "tok-1",
            "expires": 1706000000000i64,
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_item(server: &MockServer, item_id: &str, table_id: i64) {
    let service = format!("{}{}/{}", server.uri(), SERVICE_PATH, item_id);
    Mock::given(method("GET"))
        .and(path(format!("/sharing/rest/content/items/{item_id}")))
        .and(query_param("token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": item_id,
            "url": service,
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICE_PATH}/{item_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "layers": [],
            "tables": [
                { "id": table_id, "name": "Requests" },
                { "id": table_id + 1, "name": "Other" },
            ],
        })))
        .mount(server)
        .await;
}

fn arcgis_config(server: &MockServer, resources: Option<&str>) -> config::ArcGis {
    config::ArcGis {
        portal_url: server.uri(),
        username: "gss_service".into(),
        password: "change-me".into(),
        item_id: "req".into(),
        resource_item_id: resources.map(str::to_string),
    }
}

fn feature(id: &str) -> serde_json::Value {
    json!({ "attributes": { "Project_Number": id, "Client_Email": "a@gov.bc.ca" } })
}

#[tokio::test]
async fn connect_resolves_first_table_and_reads_fields() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_item(&server, "req", 3).await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICE_PATH}/req/3")))
        .and(query_param("f", "json"))
        .and(query_param("token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "fields": [
                { "name": "OBJECTID", "type": "esriFieldTypeOID" },
                { "name": "Project_Number", "type": "esriFieldTypeString" },
                { "name": "Date_Requested", "type": "esriFieldTypeDate" },
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = FeatureSource::connect(&arcgis_config(&server, None))
        .await
        .unwrap();
    let fields = source.field_names().await.unwrap();
    assert_eq!(fields, vec!["OBJECTID", "Project_Number", "Date_Requested"]);
}

#[tokio::test]
async fn window_query_follows_transfer_limit() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_item(&server, "req", 0).await;
    let query_path = format!("{SERVICE_PATH}/req/0/query");
    Mock::given(method("POST"))
        .and(path(query_path.as_str()))
        .and(body_string_contains("resultOffset=0&"))
        .and(body_string_contains("Date_Requested+BETWEEN+TIMESTAMP"))
        .and(body_string_contains("token=tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "features": [feature("GSS-1"), feature("GSS-2")],
            "exceededTransferLimit": true,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(query_path.as_str()))
        .and(body_string_contains("resultOffset=2&"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "features": [feature("GSS-3")],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = FeatureSource::connect(&arcgis_config(&server, None))
        .await
        .unwrap();
    let window = Window {
        lower: Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap(),
        upper: Utc.with_ymd_and_hms(2024, 1, 23, 8, 30, 0).unwrap(),
    };
    let records = source.query_window(&window).await.unwrap();
    let ids: Vec<&str> = records.iter().filter_map(|r| r.request_id()).collect();
    assert_eq!(ids, vec!["GSS-1", "GSS-2", "GSS-3"]);
}

#[tokio::test]
async fn error_body_fails_the_query() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_item(&server, "req", 0).await;
    Mock::given(method("POST"))
        .and(path(format!("{SERVICE_PATH}/req/0/query")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 498, "message": "Invalid token.", "details": [] }
        })))
        .mount(&server)
        .await;

    let source = FeatureSource::connect(&arcgis_config(&server, None))
        .await
        .unwrap();
    let now = Utc::now();
    let err = source
        .query_window(&Window { lower: now, upper: now })
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("498"));
}

#[tokio::test]
async fn rejected_sign_in_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sharing/rest/generateToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 400, "message": "Unable to generate token.", "details": ["Invalid username or password."] }
        })))
        .mount(&server)
        .await;

    let err = ArcGisClient::connect(&server.uri(), "gss_service", "wrong")
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("Invalid username or password."));
}

#[tokio::test]
async fn lead_query_targets_resource_table() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_item(&server, "req", 0).await;
    mount_item(&server, "res", 1).await;
    Mock::given(method("POST"))
        .and(path(format!("{SERVICE_PATH}/res/1/query")))
        .and(body_string_contains("Project_Number+IN+%28%27GSS-1%27%2C%27O%27%27Brien%27%29"))
        .and(body_string_contains("Coordinator"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "features": [{ "attributes": {
                "Project_Number": "GSS-1",
                "Resource_Name": "Sam",
                "Resource_Type": "Coordinator",
            }}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = FeatureSource::connect(&arcgis_config(&server, Some("res")))
        .await
        .unwrap();
    let leads = source
        .query_assigned_leads(&["GSS-1".to_string(), "O'Brien".to_string()])
        .await
        .unwrap();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].text("Resource_Name"), Some("Sam"));
}

#[tokio::test]
async fn lead_query_without_resource_table_is_empty() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    mount_item(&server, "req", 0).await;

    let source = FeatureSource::connect(&arcgis_config(&server, None))
        .await
        .unwrap();
    let leads = source
        .query_assigned_leads(&["GSS-1".to_string()])
        .await
        .unwrap();
    assert!(leads.is_empty());
}

#[tokio::test]
async fn folder_listing_pages_and_downloads_data() {
    let server = MockServer::start().await;
    mount_sign_in(&server).await;
    Mock::given(method("GET"))
        .and(path("/sharing/rest/content/users/gss_service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "folders": [
                { "id": "f-other", "title": "Other" },
                { "id": "f-1", "title": "SRS" },
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sharing/rest/content/users/gss_service/f-1"))
        .and(query_param("start", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "id": "a1", "name": "requests.csv", "title": "Requests", "type": "CSV" }],
            "nextStart": 2,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sharing/rest/content/users/gss_service/f-1"))
        .and(query_param("start", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "id": "b2", "title": "Web Map", "type": "Web Map" }],
            "nextStart": -1,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sharing/rest/content/items/b2/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "operationalLayers": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sharing/rest/content/items/a1/data"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(b"id,name\n1,x\n".to_vec()),
        )
        .mount(&server)
        .await;

    let client = ArcGisClient::connect(&server.uri(), "gss_service", "change-me")
        .await
        .unwrap();
    let items = client.folder_items("SRS").await.unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "b2"]);

    match client.item_data(&items[0]).await.unwrap() {
        ItemData::File(bytes) => assert_eq!(bytes, b"id,name\n1,x\n".to_vec()),
        other => panic!("expected file data, got {other:?}"),
    }
    match client.item_data(&items[1]).await.unwrap() {
        ItemData::Json(value) => assert_eq!(value, json!({ "operationalLayers": [] })),
        other => panic!("expected json data, got {other:?}"),
    }

    assert!(client.folder_items("Missing").await.is_err());
}
