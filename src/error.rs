use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Service-level failures, rendered as the SQS JSON protocol error shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqsError {
    QueueAlreadyExists(String),
    QueueDoesNotExist(String),
    InvalidAttributeName(String),
    InvalidParameterValue(String),
    MissingParameter(String),
    ReceiptHandleIsInvalid(String),
    EmptyBatchRequest,
    TooManyEntriesInBatchRequest(usize),
    BatchEntryIdsNotDistinct(String),
    InvalidAction(String),
}

impl SqsError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SqsError::QueueAlreadyExists(_) => "QueueAlreadyExists",
            SqsError::QueueDoesNotExist(_) => "AWS.SimpleQueueService.NonExistentQueue",
            SqsError::InvalidAttributeName(_) => "InvalidAttributeName",
            SqsError::InvalidParameterValue(_) => "InvalidParameterValue",
            SqsError::MissingParameter(_) => "MissingParameter",
            SqsError::ReceiptHandleIsInvalid(_) => "ReceiptHandleIsInvalid",
            SqsError::EmptyBatchRequest => "AWS.SimpleQueueService.EmptyBatchRequest",
            SqsError::TooManyEntriesInBatchRequest(_) => {
                "AWS.SimpleQueueService.TooManyEntriesInBatchRequest"
            }
            SqsError::BatchEntryIdsNotDistinct(_) => {
                "AWS.SimpleQueueService.BatchEntryIdsNotDistinct"
            }
            SqsError::InvalidAction(_) => "InvalidAction",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            SqsError::QueueAlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn message(&self) -> String {
        match self {
            SqsError::QueueAlreadyExists(name) => format!(
                "A queue already exists with the same name and a different value for attribute(s): {name}"
            ),
            SqsError::QueueDoesNotExist(name) => {
                format!("The specified queue {name} does not exist for this wsdl version.")
            }
            SqsError::InvalidAttributeName(name) => format!("Unknown Attribute {name}."),
            SqsError::InvalidParameterValue(m) | SqsError::MissingParameter(m) => m.clone(),
            SqsError::ReceiptHandleIsInvalid(handle) => {
                format!("The input receipt handle \"{handle}\" is not a valid receipt handle.")
            }
            SqsError::EmptyBatchRequest => {
                "There should be at least one SendMessageBatchRequestEntry in the request.".into()
            }
            SqsError::TooManyEntriesInBatchRequest(n) => {
                format!("Maximum number of entries per request are 10. You have sent {n}.")
            }
            SqsError::BatchEntryIdsNotDistinct(id) => {
                format!("Id {id} repeated.")
            }
            SqsError::InvalidAction(m) => m.clone(),
        }
    }
}

impl IntoResponse for SqsError {
    fn into_response(self) -> Response {
        let body = json!({
            "__type": format!("com.amazonaws.sqs#{}", self.error_code()),
            "message": self.message(),
        });
        (self.status_code(), axum::Json(body)).into_response()
    }
}
