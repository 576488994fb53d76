use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use crate::error::SqsError;
use crate::state::SqsState;
use crate::types::*;

macro_rules! dispatch {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        let resp = $state.$method(req).await?;
        Ok(Json(serde_json::to_value(resp).unwrap()).into_response())
    }};
}

macro_rules! dispatch_empty {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        $state.$method(req).await?;
        Ok(Json(serde_json::json!({})).into_response())
    }};
}

async fn handle_request(
    State(state): State<Arc<SqsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, SqsError> {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SqsError::InvalidAction("Missing X-Amz-Target header".into()))?;

    let action = target
        .strip_prefix("AmazonSQS.")
        .ok_or_else(|| SqsError::InvalidAction(format!("Invalid target: {target}")))?;
    debug!(action, "dispatching");

    match action {
        "CreateQueue" => dispatch!(state, body, CreateQueueRequest, create_queue),
        "DeleteQueue" => dispatch_empty!(state, body, DeleteQueueRequest, delete_queue),
        "GetQueueUrl" => dispatch!(state, body, GetQueueUrlRequest, get_queue_url),
        "ListQueues" => dispatch!(state, body, ListQueuesRequest, list_queues),
        "GetQueueAttributes" => {
            dispatch!(state, body, GetQueueAttributesRequest, get_queue_attributes)
        }
        "SetQueueAttributes" => {
            dispatch_empty!(state, body, SetQueueAttributesRequest, set_queue_attributes)
        }
        "PurgeQueue" => dispatch_empty!(state, body, PurgeQueueRequest, purge_queue),
        "SendMessage" => dispatch!(state, body, SendMessageRequest, send_message),
        "SendMessageBatch" => {
            dispatch!(state, body, SendMessageBatchRequest, send_message_batch)
        }
        "ReceiveMessage" => {
            dispatch!(state, body, ReceiveMessageRequest, receive_message)
        }
        "DeleteMessage" => {
            dispatch_empty!(state, body, DeleteMessageRequest, delete_message)
        }
        "DeleteMessageBatch" => {
            dispatch!(state, body, DeleteMessageBatchRequest, delete_message_batch)
        }
        "ChangeMessageVisibility" => {
            dispatch_empty!(
                state,
                body,
                ChangeMessageVisibilityRequest,
                change_message_visibility
            )
        }
        "ChangeMessageVisibilityBatch" => {
            dispatch!(
                state,
                body,
                ChangeMessageVisibilityBatchRequest,
                change_message_visibility_batch
            )
        }
        "TagQueue" => dispatch_empty!(state, body, TagQueueRequest, tag_queue),
        "UntagQueue" => dispatch_empty!(state, body, UntagQueueRequest, untag_queue),
        "ListQueueTags" => dispatch!(state, body, ListQueueTagsRequest, list_queue_tags),
        "AddPermission" => {
            dispatch_empty!(state, body, AddPermissionRequest, add_permission)
        }
        "RemovePermission" => {
            dispatch_empty!(state, body, RemovePermissionRequest, remove_permission)
        }
        "ListDeadLetterSourceQueues" => {
            dispatch!(
                state,
                body,
                ListDeadLetterSourceQueuesRequest,
                list_dead_letter_source_queues
            )
        }
        _ => Err(SqsError::InvalidAction(format!("Unknown action: {action}"))),
    }
}

pub fn create_router(state: Arc<SqsState>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        create_router(Arc::new(SqsState::new(
            "000000000000".into(),
            "us-east-1".into(),
            9324,
        )))
    }

    fn request(action: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("X-Amz-Target", format!("AmazonSQS.{action}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(app: &Router, action: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(request(action, body))
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn create_send_receive_delete_over_http() {
        let app = router();

        let (status, created) =
            call(&app, "CreateQueue", json!({"QueueName": "wire"})).await;
        assert_eq!(status, StatusCode::OK);
        let url = created["QueueUrl"].as_str().unwrap().to_string();
        assert!(url.ends_with("/000000000000/wire"));

        let (status, sent) = call(
            &app,
            "SendMessage",
            json!({"QueueUrl": url, "MessageBody": "over the wire"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(sent["MessageId"].is_string());
        assert!(sent["MD5OfMessageBody"].is_string());

        let (status, received) = call(
            &app,
            "ReceiveMessage",
            json!({"QueueUrl": url, "WaitTimeSeconds": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let message = &received["Messages"][0];
        assert_eq!(message["Body"], "over the wire");
        assert_eq!(message["MD5OfBody"], sent["MD5OfMessageBody"]);

        let (status, deleted) = call(
            &app,
            "DeleteMessage",
            json!({
                "QueueUrl": url,
                "ReceiptHandle": message["ReceiptHandle"],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted, json!({}));
    }

    #[tokio::test]
    async fn errors_use_the_json_protocol_shape() {
        let app = router();

        let (status, body) = call(
            &app,
            "GetQueueUrl",
            json!({"QueueName": "missing"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["__type"],
            "com.amazonaws.sqs#AWS.SimpleQueueService.NonExistentQueue"
        );
        assert!(body["message"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let app = router();
        let (status, body) = call(&app, "TeleportMessage", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "com.amazonaws.sqs#InvalidAction");
    }

    #[tokio::test]
    async fn missing_target_header_is_rejected() {
        let app = router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_an_invalid_parameter() {
        let app = router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("X-Amz-Target", "AmazonSQS.CreateQueue")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["__type"], "com.amazonaws.sqs#InvalidParameterValue");
    }

    #[tokio::test]
    async fn batch_response_carries_both_result_lists() {
        let app = router();
        let (_, created) = call(&app, "CreateQueue", json!({"QueueName": "b"})).await;
        let url = created["QueueUrl"].clone();

        let (status, body) = call(
            &app,
            "SendMessageBatch",
            json!({
                "QueueUrl": url,
                "Entries": [
                    {"Id": "ok", "MessageBody": "fine"},
                    {"Id": "bad", "MessageBody": "late", "DelaySeconds": 1800},
                ],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Successful"].as_array().unwrap().len(), 1);
        assert_eq!(body["Failed"][0]["Id"], "bad");
        assert_eq!(body["Failed"][0]["SenderFault"], true);
    }
}
