use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String,      // ISO 8601 timestamp
    pub correlation_id: String, // Groups a request with its response
    pub event_type: EventType,
    pub direction: Direction,
    pub operation: String,       // e.g. "webhook", "PUT /api/v5/repos/o/r/contents/x.spec"
    pub data: serde_json::Value, // Sanitized request/response data
    pub metadata: HashMap<String, String>, // Request id, PR number, etc.
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EventType {
    WebhookReceived,
    GitHostingCall,
    BuildFarmCall,
    LogAnalysisCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

/// Which outbound collaborator a recorded call went to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    GitHosting,
    BuildFarm,
    LogAnalysis,
}

impl ServiceType {
    pub fn event_type(self) -> EventType {
        match self {
            ServiceType::GitHosting => EventType::GitHostingCall,
            ServiceType::BuildFarm => EventType::BuildFarmCall,
            ServiceType::LogAnalysis => EventType::LogAnalysisCall,
        }
    }
}

// Correlation ID carried in request extensions
#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

// Header name for correlation ID propagation
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
