//! 内存日历工具（演示与测试用）
//!
//! create_event / list_events / delete_event 共享同一份事件表。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::transport::{LocalTool, LocalTransport};
use crate::tools::ToolSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// 事件表
#[derive(Clone, Default)]
pub struct Calendar {
    events: Arc<Mutex<Vec<CalendarEvent>>>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// 注册全部日历工具到本地传输
    pub fn register(&self, transport: &mut LocalTransport) {
        transport.register(Arc::new(CreateEventTool(self.clone())));
        transport.register(Arc::new(ListEventsTool(self.clone())));
        transport.register(Arc::new(DeleteEventTool(self.clone())));
    }

    /// 与上面工具对应的规格
    pub fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                description: "Create a calendar event".into(),
                ..ToolSpec::new("create_event")
            }
            .with_request_schema(json!({
                "type": "object",
                "required": ["title", "start_time"],
                "properties": {
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "start_time": { "type": "string" },
                    "end_time": { "type": "string" }
                }
            }))
            .with_response_schema(json!({
                "type": "object",
                "required": ["id", "title", "start_time"],
                "properties": { "id": { "type": "string" } }
            })),
            ToolSpec {
                description: "List calendar events, optionally for one day (YYYY-MM-DD)".into(),
                ..ToolSpec::new("list_events")
            }
            .idempotent(true)
            .with_request_schema(json!({
                "type": "object",
                "properties": { "date": { "type": "string" } }
            }))
            .with_response_schema(json!({
                "type": "object",
                "required": ["events"],
                "properties": { "events": { "type": "array" } }
            })),
            ToolSpec {
                description: "Delete a calendar event by id".into(),
                ..ToolSpec::new("delete_event")
            }
            .idempotent(true)
            .with_request_schema(json!({
                "type": "object",
                "required": ["event_id"],
                "properties": { "event_id": { "type": "string" } }
            }))
            .with_response_schema(json!({
                "type": "object",
                "required": ["deleted"],
                "properties": { "deleted": { "type": "boolean" } }
            })),
        ]
    }
}

fn str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

struct CreateEventTool(Calendar);

#[async_trait]
impl LocalTool for CreateEventTool {
    fn name(&self) -> &str {
        "create_event"
    }

    async fn call(&self, args: Value) -> Result<Value, String> {
        let title = str_arg(&args, "title").ok_or("title is required")?;
        let start_time = str_arg(&args, "start_time").ok_or("start_time is required")?;
        let event = CalendarEvent {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            description: str_arg(&args, "description"),
            start_time,
            end_time: str_arg(&args, "end_time"),
        };
        let mut events = self.0.events.lock().map_err(|_| "calendar unavailable")?;
        let clash = events.iter().any(|e| e.start_time == event.start_time);
        if clash {
            return Err(format!("an event already starts at {}", event.start_time));
        }
        events.push(event.clone());
        serde_json::to_value(event).map_err(|e| e.to_string())
    }
}

struct ListEventsTool(Calendar);

#[async_trait]
impl LocalTool for ListEventsTool {
    fn name(&self) -> &str {
        "list_events"
    }

    async fn call(&self, args: Value) -> Result<Value, String> {
        let date = str_arg(&args, "date");
        let events = self.0.events.lock().map_err(|_| "calendar unavailable")?;
        let matching: Vec<&CalendarEvent> = events
            .iter()
            .filter(|e| date.as_deref().map_or(true, |d| e.start_time.starts_with(d)))
            .collect();
        Ok(json!({ "events": matching }))
    }
}

struct DeleteEventTool(Calendar);

#[async_trait]
impl LocalTool for DeleteEventTool {
    fn name(&self) -> &str {
        "delete_event"
    }

    async fn call(&self, args: Value) -> Result<Value, String> {
        let id = str_arg(&args, "event_id").ok_or("event_id is required")?;
        let mut events = self.0.events.lock().map_err(|_| "calendar unavailable")?;
        let before = events.len();
        events.retain(|e| e.id != id);
        Ok(json!({ "deleted": events.len() < before }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::transport::ToolTransport;
    use crate::tools::{ToolRequest, ToolResult};

    async fn call(transport: &LocalTransport, tool: &str, parameters: Value) -> ToolResult {
        let req = ToolRequest {
            tool_name: tool.into(),
            parameters,
            session_token: "s:1".into(),
        };
        let envelope = transport.send(&ToolSpec::new(tool), &req).await.unwrap();
        ToolResult::from_envelope(&envelope).unwrap()
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let calendar = Calendar::new();
        let mut transport = LocalTransport::new();
        calendar.register(&mut transport);

        let created = call(
            &transport,
            "create_event",
            json!({"title": "standup", "start_time": "2026-10-16T09:00"}),
        )
        .await;
        assert!(created.is_ok());
        let id = created.payload.unwrap()["id"].as_str().unwrap().to_string();

        let clash = call(
            &transport,
            "create_event",
            json!({"title": "retro", "start_time": "2026-10-16T09:00"}),
        )
        .await;
        assert!(!clash.is_ok());

        let listed = call(&transport, "list_events", json!({"date": "2026-10-16"})).await;
        assert_eq!(listed.payload.unwrap()["events"].as_array().unwrap().len(), 1);

        let deleted = call(&transport, "delete_event", json!({"event_id": id})).await;
        assert_eq!(deleted.payload.unwrap()["deleted"], json!(true));
        assert!(calendar.events().is_empty());
    }
}
