//! HTTP behaviour of the license REST client against a mock server

use license_pubsub::api::{
    ApiError, HttpLicenseApi, LicenseApi, LicenseRequest, PaymentRequest,
};
use license_pubsub::config::ApiSection;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_for(server: &MockServer) -> HttpLicenseApi {
    HttpLicenseApi::new(&ApiSection {
        base_url: server.uri(),
        timeout_secs: 5,
        signature_header: "signature".to_string(),
    })
    .unwrap()
}

fn payment_request() -> PaymentRequest {
    PaymentRequest {
        device: "dev-1".to_string(),
    }
}

#[tokio::test]
async fn test_pay_posts_device_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/license/v1/license/lic-7/pay-with-transfermovil/"))
        .and(header("authorization", "Bearer token-1"))
        .and(body_json(json!({"device": "dev-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"qr": "{id_transaccion:TX-1}"})))
        .expect(1)
        .mount(&server)
        .await;

    let response = api_for(&server)
        .pay_license("lic-7", &payment_request(), "token-1")
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.qr.as_deref(), Some("{id_transaccion:TX-1}"));
    assert_eq!(response.signature, None);
}

#[tokio::test]
async fn test_signature_header_and_raw_body_are_kept() {
    let server = MockServer::start().await;
    let raw = r#"{"license":"Pro Annual"}"#;
    Mock::given(method("POST"))
        .and(path("/license/v1/license/verify/"))
        .and(body_json(json!({"package_name": "com.example.app", "device": "dev-1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("signature", "c2lnbmVk")
                .set_body_raw(raw, "application/json"),
        )
        .mount(&server)
        .await;

    let request = LicenseRequest {
        package_name: "com.example.app".to_string(),
        device: "dev-1".to_string(),
    };
    let response = api_for(&server)
        .verify_license(&request, "token-1")
        .await
        .unwrap();

    assert_eq!(response.body.license, "Pro Annual");
    assert!(response.body.has_paid_license());
    assert_eq!(response.signature.as_deref(), Some("c2lnbmVk"));
    assert_eq!(&response.raw_body[..], raw.as_bytes());
}

#[tokio::test]
async fn test_error_status_carries_body_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("License not for sale"))
        .mount(&server)
        .await;

    let err = api_for(&server)
        .pay_license("lic-7", &payment_request(), "token-1")
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ApiError::Status {
            code: 403,
            message: "License not for sale".to_string()
        }
    );
    assert_eq!(err.status_code(), Some(403));
}

#[tokio::test]
async fn test_error_status_without_body_uses_reason_phrase() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = api_for(&server)
        .pay_license("missing", &payment_request(), "token-1")
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ApiError::Status {
            code: 404,
            message: "Not Found".to_string()
        }
    );
}

#[tokio::test]
async fn test_empty_success_body_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let err = api_for(&server)
        .pay_license("lic-7", &payment_request(), "token-1")
        .await
        .unwrap_err();

    assert_eq!(err, ApiError::EmptyBody { code: 200 });
}

#[tokio::test]
async fn test_undecodable_body_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = api_for(&server)
        .pay_license("lic-7", &payment_request(), "token-1")
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Decode(_)), "{err:?}");
    assert_eq!(err.status_code(), None);
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    let server = MockServer::start().await;
    let api = api_for(&server);
    drop(server);

    let err = api
        .pay_license("lic-7", &payment_request(), "token-1")
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Network(_)), "{err:?}");
}
