use crate::dispatch::{DispatchRequest, DispatchScheduler};
use crate::error::ToolError;

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

pub const NOT_FOUND_MESSAGE: &str =
    "I couldn't find a booking under that phone number. Could you double-check the number?";
pub const NO_SLOTS_MESSAGE: &str =
    "I don't see any openings for that day. Would another day work for you?";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolName {
    FetchAvailability,
    CreateBooking,
    LookupBooking,
    Reschedule,
    Cancel,
    FetchPricing,
    FetchKnowledge,
    CheckServiceArea,
    DispatchEmergency,
}

impl ToolName {
    /// Accepts kebab-case or snake_case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().replace('_', "-").as_str() {
            "fetch-availability" => Some(ToolName::FetchAvailability),
            "create-booking" => Some(ToolName::CreateBooking),
            "lookup-booking" => Some(ToolName::LookupBooking),
            "reschedule" => Some(ToolName::Reschedule),
            "cancel" => Some(ToolName::Cancel),
            "fetch-pricing" => Some(ToolName::FetchPricing),
            "fetch-knowledge" => Some(ToolName::FetchKnowledge),
            "check-service-area" => Some(ToolName::CheckServiceArea),
            "dispatch-emergency" => Some(ToolName::DispatchEmergency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::FetchAvailability => "fetch-availability",
            ToolName::CreateBooking => "create-booking",
            ToolName::LookupBooking => "lookup-booking",
            ToolName::Reschedule => "reschedule",
            ToolName::Cancel => "cancel",
            ToolName::FetchPricing => "fetch-pricing",
            ToolName::FetchKnowledge => "fetch-knowledge",
            ToolName::CheckServiceArea => "check-service-area",
            ToolName::DispatchEmergency => "dispatch-emergency",
        }
    }

    /// Deadline for a single attempt.
    pub fn timeout(&self) -> Duration {
        match self {
            ToolName::CreateBooking | ToolName::Reschedule | ToolName::Cancel => WRITE_TIMEOUT,
            ToolName::DispatchEmergency => DISPATCH_TIMEOUT,
            _ => LOOKUP_TIMEOUT,
        }
    }
}

/// A tool invocation issued by the voice model, waiting for execution.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Id the model assigned to this invocation; echoed back with the result.
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    pub attempt: u32,
    /// Set when execution starts, not when the call is queued behind earlier ones.
    pub deadline: Option<tokio::time::Instant>,
}

impl ToolCallRequest {
    pub fn new(call_id: String, name: String, arguments: Value) -> Self {
        Self {
            call_id,
            name,
            arguments,
            attempt: 0,
            deadline: None,
        }
    }
}

/// Who the tool call is made on behalf of.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub call_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub from_number: String,
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' || c == '-' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Tool arguments arrive either as a JSON object or as a string holding one. Keys are normalized
/// to camelCase.
pub fn parse_arguments(raw: &Value) -> Result<Map<String, Value>, ToolError> {
    let object = match raw {
        Value::Object(map) => map.clone(),
        Value::String(s) if s.trim().is_empty() => Map::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(ToolError::InvalidArguments("expected an object".into())),
            Err(e) => return Err(ToolError::InvalidArguments(e.to_string())),
        },
        Value::Null => Map::new(),
        _ => return Err(ToolError::InvalidArguments("expected an object".into())),
    };
    Ok(object
        .into_iter()
        .map(|(k, v)| (snake_to_camel(&k), v))
        .collect())
}

fn typed<T: for<'de> Deserialize<'de>>(args: &Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Booleans the model sometimes sends as `"true"` / `"yes"`.
fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    match Value::deserialize(d)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) => Ok(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1"
        )),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::Null => Ok(false),
        other => Err(de::Error::custom(format!("expected a boolean, got {other}"))),
    }
}

/// Integers the model sometimes sends as `"60"`.
fn flexible_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => Ok(n.as_u64().map(|n| n as u32)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got '{s}'"))),
        Value::Null => Ok(None),
        other => Err(de::Error::custom(format!("expected a number, got {other}"))),
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityParams {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time_preference: Option<String>,
    #[serde(default, deserialize_with = "flexible_u32")]
    pub duration: Option<u32>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_emergency: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingParams {
    pub customer_name: String,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub address: String,
    #[serde(default)]
    pub service_type: Option<String>,
    pub start_time: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_emergency: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookingChangeParams {
    #[serde(default, alias = "phone")]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub new_start_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAreaParams {
    pub address: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyParams {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, alias = "issueDescription", alias = "issue")]
    pub notes: Option<String>,
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default, alias = "startTime")]
    pub suggested_start: Option<String>,
}

impl EmergencyParams {
    fn into_request(self, ctx: &ToolContext) -> Result<DispatchRequest, ToolError> {
        let booking_id = match self.booking_id.filter(|s| !s.trim().is_empty()) {
            Some(id) => Some(
                id.trim()
                    .parse()
                    .map_err(|_| ToolError::InvalidArguments(format!("bad booking id '{id}'")))?,
            ),
            None => None,
        };
        let suggested_start = match self.suggested_start.filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(
                OffsetDateTime::parse(raw.trim(), &time::format_description::well_known::Rfc3339)
                    .map_err(|_| ToolError::InvalidArguments(format!("bad start time '{raw}'")))?,
            ),
            None => None,
        };
        Ok(DispatchRequest {
            tenant_id: ctx.tenant_id.clone(),
            customer_name: self.customer_name.unwrap_or_default(),
            customer_phone: self
                .customer_phone
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| ctx.from_number.clone()),
            address: self.address.unwrap_or_default(),
            notes: self.notes,
            call_id: Some(ctx.call_id.clone()),
            booking_id,
            suggested_start,
        })
    }
}

/// Executes one attempt of a tool call.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(
        &self,
        ctx: &ToolContext,
        tool: ToolName,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError>;
}

/// Backend actions over HTTP; emergency dispatch runs in-process.
pub struct HttpToolBackend {
    http_client: reqwest::Client,
    base_url: String,
    scheduler: Arc<DispatchScheduler>,
}

impl HttpToolBackend {
    pub fn new(http_client: reqwest::Client, base_url: String, scheduler: Arc<DispatchScheduler>) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            scheduler,
        }
    }

    async fn read_response(
        resp: reqwest::Response,
        not_found_ok: bool,
    ) -> Result<Value, ToolError> {
        let status = resp.status();
        let body = resp.text().await.map_err(ToolError::from)?;
        if status == reqwest::StatusCode::NOT_FOUND && not_found_ok {
            return Ok(json!({ "found": false, "result": NOT_FOUND_MESSAGE }));
        }
        if !status.is_success() {
            return Err(ToolError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str::<Value>(&body).unwrap_or_else(|_| json!({ "result": body })))
    }

    async fn post(
        &self,
        path: &str,
        body: Value,
        timeout: Duration,
        not_found_ok: bool,
    ) -> Result<Value, ToolError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url=%url, "tool POST");
        let resp = self
            .http_client
            .post(url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;
        Self::read_response(resp, not_found_ok).await
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url=%url, "tool GET");
        let resp = self
            .http_client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;
        Self::read_response(resp, false).await
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    async fn execute(
        &self,
        ctx: &ToolContext,
        tool: ToolName,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let timeout = tool.timeout();
        match tool {
            ToolName::FetchAvailability => {
                let p: AvailabilityParams = typed(args)?;
                let mut resp = self
                    .post(
                        "/api/availability",
                        json!({
                            "tenantId": ctx.tenant_id,
                            "date": p.date,
                            "timePreference": p.time_preference,
                            "duration": p.duration.unwrap_or(60),
                            "isEmergency": p.is_emergency,
                        }),
                        timeout,
                        false,
                    )
                    .await?;
                let empty = resp
                    .get("slots")
                    .and_then(Value::as_array)
                    .map(|s| s.is_empty())
                    .unwrap_or(false);
                if empty && resp.get("result").is_none() {
                    resp["result"] = json!(NO_SLOTS_MESSAGE);
                }
                Ok(resp)
            }
            ToolName::CreateBooking => {
                let p: CreateBookingParams = typed(args)?;
                self.post(
                    "/api/bookings",
                    json!({
                        "tenantId": ctx.tenant_id,
                        "callId": ctx.call_id,
                        "agentId": ctx.agent_id,
                        "customerName": p.customer_name,
                        "customerPhone": p.customer_phone.unwrap_or_else(|| ctx.from_number.clone()),
                        "customerEmail": p.customer_email,
                        "address": p.address,
                        "serviceType": p.service_type,
                        "startTime": p.start_time,
                        "notes": p.notes,
                        "isEmergency": p.is_emergency,
                    }),
                    timeout,
                    false,
                )
                .await
            }
            ToolName::LookupBooking | ToolName::Reschedule | ToolName::Cancel => {
                let p: BookingChangeParams = typed(args)?;
                let path = match tool {
                    ToolName::LookupBooking => "/api/bookings/lookup",
                    ToolName::Reschedule => "/api/bookings/reschedule",
                    _ => "/api/bookings/cancel",
                };
                if tool == ToolName::Reschedule && p.new_start_time.is_none() {
                    return Err(ToolError::InvalidArguments("newStartTime is required".into()));
                }
                self.post(
                    path,
                    json!({
                        "tenantId": ctx.tenant_id,
                        "customerPhone": p.customer_phone.unwrap_or_else(|| ctx.from_number.clone()),
                        "bookingId": p.booking_id,
                        "newStartTime": p.new_start_time,
                        "reason": p.reason,
                    }),
                    timeout,
                    true,
                )
                .await
            }
            ToolName::FetchPricing => {
                self.get("/api/pricing", &[("tenantId", ctx.tenant_id.as_str())], timeout)
                    .await
            }
            ToolName::FetchKnowledge => {
                let topic = args.get("query").or_else(|| args.get("topic")).and_then(Value::as_str);
                let mut query = vec![("tenantId", ctx.tenant_id.as_str())];
                if let Some(topic) = topic {
                    query.push(("query", topic));
                }
                self.get("/api/knowledge", &query, timeout).await
            }
            ToolName::CheckServiceArea => {
                let p: ServiceAreaParams = typed(args)?;
                self.post(
                    "/api/service-area",
                    json!({ "tenantId": ctx.tenant_id, "address": p.address }),
                    timeout,
                    false,
                )
                .await
            }
            ToolName::DispatchEmergency => {
                let request = typed::<EmergencyParams>(args)?.into_request(ctx)?;
                match tokio::time::timeout(timeout, self.scheduler.dispatch(request)).await {
                    Ok(Ok(outcome)) => Ok(outcome.to_json()),
                    Ok(Err(e)) => {
                        error!(error=%e, call_sid=%ctx.call_id, "emergency dispatch failed");
                        Err(ToolError::Dispatch(e))
                    }
                    // Not retried: a slow dispatch may already have committed a booking.
                    Err(_) => Err(ToolError::Request("emergency dispatch timed out".into())),
                }
            }
        }
    }
}
