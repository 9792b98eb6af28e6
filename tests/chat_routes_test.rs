// ABOUTME: Integration tests for the chat HTTP surface
// ABOUTME: Covers turn submission, conversation listing and detail, archival, and SSE streaming
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use common::{
    api_request, create_app, offline_config, parse_sse_payloads, response_json, response_text,
};

use arbor_server::config::ServerConfig;
use axum::http::{header, StatusCode};
use serde_json::json;
use tower::ServiceExt;

const SAFE_CONTENT: &str = "Tell me about the Rust borrow checker";
const USER_HEADER: [(&str, &str); 1] = [("x-user-id", "user-1")];

fn canned_config() -> ServerConfig {
    ServerConfig {
        canned_responses: true,
        moderation_disabled: true,
        ..ServerConfig::default()
    }
}

fn today_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

// ============================================================================
// Identity and Validation
// ============================================================================

#[tokio::test]
async fn test_turn_requires_user_header() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &[],
        Some(json!({"content": SAFE_CONTENT})),
    );
    let response = harness.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"]["kind"], "INVALID_INPUT");
    assert_eq!(body["error"]["message"], "Missing x-user-id header");
}

#[tokio::test]
async fn test_blank_content_is_rejected() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": "   "})),
    );
    let response = harness.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"]["kind"], "INVALID_INPUT");
    assert_eq!(body["error"]["message"], "Content is required");
}

#[tokio::test]
async fn test_unknown_conversation_is_404() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": SAFE_CONTENT, "conversation_id": "missing"})),
    );
    let response = harness.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await;
    assert_eq!(body["error"]["kind"], "NOT_FOUND");
    assert_eq!(body["error"]["message"], "Conversation not found");
}

// ============================================================================
// Turn Round Trip
// ============================================================================

#[tokio::test]
async fn test_turn_round_trip() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": SAFE_CONTENT})),
    );
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let outcome = response_json(response).await;
    assert_eq!(outcome["created_conversation"], true);
    assert_eq!(outcome["idempotent_replay"], false);
    assert_eq!(outcome["user_message"]["content"], SAFE_CONTENT);
    assert_eq!(outcome["model"]["provider"], "openai");
    let reply = outcome["assistant_message"]["content"].as_str().unwrap();
    assert!(reply.starts_with("Canned response:"));
    let conversation_id = outcome["conversation"]["id"].as_str().unwrap();

    // The conversation shows up in the owner's listing
    let request = api_request("GET", "/api/conversations", &USER_HEADER, None);
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listing = response_json(response).await;
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["conversations"][0]["id"], conversation_id);
    assert_eq!(listing["conversations"][0]["title"], SAFE_CONTENT);

    // The detail view returns the stored pair and no branches
    let request = api_request(
        "GET",
        &format!("/api/conversations/{conversation_id}"),
        &USER_HEADER,
        None,
    );
    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = response_json(response).await;
    assert_eq!(detail["conversation"]["id"], conversation_id);
    assert_eq!(detail["messages"].as_array().unwrap().len(), 2);
    assert!(detail["branches"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_conversations_scoped_to_owner() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": SAFE_CONTENT})),
    );
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let outcome = response_json(response).await;
    let conversation_id = outcome["conversation"]["id"].as_str().unwrap().to_owned();

    let stranger = [("x-user-id", "user-2")];
    let request = api_request("GET", "/api/conversations", &stranger, None);
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let listing = response_json(response).await;
    assert_eq!(listing["total"], 0);

    let request = api_request(
        "GET",
        &format!("/api/conversations/{conversation_id}"),
        &stranger,
        None,
    );
    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Archival
// ============================================================================

#[tokio::test]
async fn test_archive_flow() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": SAFE_CONTENT})),
    );
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let outcome = response_json(response).await;
    let conversation_id = outcome["conversation"]["id"].as_str().unwrap().to_owned();

    let request = api_request(
        "DELETE",
        &format!("/api/conversations/{conversation_id}"),
        &USER_HEADER,
        None,
    );
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Gone from listings, still readable by direct fetch
    let request = api_request("GET", "/api/conversations", &USER_HEADER, None);
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let listing = response_json(response).await;
    assert_eq!(listing["total"], 0);

    let request = api_request(
        "GET",
        &format!("/api/conversations/{conversation_id}"),
        &USER_HEADER,
        None,
    );
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = response_json(response).await;
    assert_eq!(detail["conversation"]["archived"], true);

    let request = api_request("DELETE", "/api/conversations/missing", &USER_HEADER, None);
    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Quota Mapping
// ============================================================================

#[tokio::test]
async fn test_quota_exhaustion_maps_to_429() {
    let harness = create_app(canned_config(), vec![]).await.unwrap();
    let day = today_utc();
    for _ in 0..10 {
        harness.database.usage().increment("user-1", &day).await.unwrap();
    }

    let request = api_request(
        "POST",
        "/api/turns",
        &[("x-user-id", "user-1"), ("x-plan", "free")],
        Some(json!({"content": SAFE_CONTENT})),
    );
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = response_json(response).await;
    assert_eq!(body["error"]["kind"], "QUOTA_EXCEEDED");

    // The paid plan sails through at the same count
    let request = api_request(
        "POST",
        "/api/turns",
        &[("x-user-id", "user-1"), ("x-plan", "pro")],
        Some(json!({"content": SAFE_CONTENT})),
    );
    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// SSE Streaming
// ============================================================================

#[tokio::test]
async fn test_streaming_turn_emits_deltas_and_final() {
    let harness = create_app(offline_config(), vec![Ok("alpha beta gamma".to_owned())])
        .await
        .unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": SAFE_CONTENT, "stream": true})),
    );
    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response_text(response).await;
    let events = parse_sse_payloads(&body);
    assert!(events.len() >= 2, "expected deltas and a final event: {events:?}");

    let (last, deltas) = events.split_last().unwrap();
    let mut streamed = String::new();
    for event in deltas {
        assert_eq!(event["type"], "delta");
        streamed.push_str(event["text"].as_str().unwrap());
    }
    assert_eq!(streamed, "alpha beta gamma");

    assert_eq!(last["type"], "final");
    assert_eq!(last["payload"]["created_conversation"], true);
    assert_eq!(
        last["payload"]["assistant_message"]["content"],
        "alpha beta gamma"
    );
}

#[tokio::test]
async fn test_streaming_turn_reports_failure() {
    // No scripted replies, so every fallback candidate fails
    let harness = create_app(offline_config(), vec![]).await.unwrap();

    let request = api_request(
        "POST",
        "/api/turns",
        &USER_HEADER,
        Some(json!({"content": SAFE_CONTENT, "stream": true})),
    );
    let response = harness.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_text(response).await;
    let events = parse_sse_payloads(&body);
    assert_eq!(events.len(), 1, "expected a single error event: {events:?}");
    assert_eq!(events[0]["type"], "error");
    assert_eq!(events[0]["status"], 502);
    assert_eq!(events[0]["error"], "reply script exhausted");
}
