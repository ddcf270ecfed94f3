use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Rewards travel with eight decimal places; the server stores `NUMERIC(10,8)`.
const REWARD_SCALE: f64 = 100_000_000.0;

pub fn round_reward(amount: f64) -> f64 {
    if !amount.is_finite() {
        return 0.0;
    }
    (amount * REWARD_SCALE).round() / REWARD_SCALE
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload<'a> {
    pub user_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCompletedPayload<'a> {
    pub user_id: &'a str,
    pub completed_reward: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload<'a> {
    pub user_id: &'a str,
    pub final_reward: f64,
}

/// Fields every reply carries. Checked before the endpoint-specific shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyEnvelope {
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    #[serde(default, alias = "remainingSeconds", deserialize_with = "lenient_number")]
    pub remaining_seconds: Option<f64>,
    #[serde(default, alias = "newBalance", deserialize_with = "lenient_number")]
    pub new_balance: Option<f64>,
}

/// Primary `GET /processing/status/{userId}` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CountdownStatusResponse {
    #[serde(default, deserialize_with = "lenient_flag")]
    pub processing_active: Option<bool>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub remaining_seconds: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub accumulated_reward: Option<f64>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub is_completed: Option<bool>,
}

/// Legacy `POST /processing/status` reply. Older servers spell the fields in
/// camelCase or drop the `_seconds` suffix.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyStatusResponse {
    #[serde(
        default,
        alias = "processingActive",
        alias = "processingactive",
        deserialize_with = "lenient_flag"
    )]
    pub processing_active: Option<bool>,
    #[serde(
        default,
        alias = "remainingSeconds",
        alias = "remaining",
        deserialize_with = "lenient_number"
    )]
    pub remaining_seconds: Option<f64>,
    #[serde(
        default,
        alias = "accumulatedReward",
        alias = "accumulated_processing_reward",
        deserialize_with = "lenient_number"
    )]
    pub accumulated_reward: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccumulatedResponse {
    #[serde(
        rename = "accumulatedReward",
        alias = "accumulated_reward",
        default,
        deserialize_with = "lenient_number"
    )]
    pub accumulated_reward: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveCompletedResponse {
    #[serde(default, deserialize_with = "lenient_number")]
    pub reward_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponse {
    #[serde(default, alias = "newBalance", deserialize_with = "lenient_number")]
    pub new_balance: Option<f64>,
}

pub fn value_as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn value_as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        // Postgres NUMERIC columns come back as strings.
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_flag))
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_reward_keeps_eight_decimals() {
        assert_eq!(round_reward(0.248883123456), 0.24888312);
        assert_eq!(round_reward(0.125), 0.125);
        assert_eq!(round_reward(f64::NAN), 0.0);
        assert_eq!(round_reward(f64::INFINITY), 0.0);
    }

    #[test]
    fn countdown_status_accepts_integer_flags() {
        let status: CountdownStatusResponse = serde_json::from_value(json!({
            "success": true,
            "processing_active": 1,
            "remaining_seconds": 43200,
            "accumulated_reward": "0.13000000",
            "is_completed": 0
        }))
        .expect("countdown status should deserialize");
        assert_eq!(status.processing_active, Some(true));
        assert_eq!(status.remaining_seconds, Some(43200.0));
        assert_eq!(status.accumulated_reward, Some(0.13));
        assert_eq!(status.is_completed, Some(false));
    }

    #[test]
    fn legacy_status_reads_camel_case_aliases() {
        let status: LegacyStatusResponse = serde_json::from_value(json!({
            "success": true,
            "processingActive": true,
            "remainingSeconds": 120.0
        }))
        .expect("legacy status should deserialize");
        assert_eq!(status.processing_active, Some(true));
        assert_eq!(status.remaining_seconds, Some(120.0));
        assert_eq!(status.accumulated_reward, None);
    }

    #[test]
    fn missing_success_is_rejected() {
        let err = serde_json::from_value::<ReplyEnvelope>(json!({"new_balance": 1.0}))
            .expect_err("success is required");
        assert!(err.to_string().contains("missing field `success`"));
    }

    #[test]
    fn unparseable_values_become_none() {
        assert_eq!(value_as_flag(&json!("maybe")), None);
        assert_eq!(value_as_number(&json!("abc")), None);
        assert_eq!(value_as_number(&json!(null)), None);
        assert_eq!(value_as_flag(&json!("TRUE")), Some(true));
    }

    #[test]
    fn request_payloads_use_camel_case() {
        let body = serde_json::to_value(CompletePayload {
            user_id: "42",
            final_reward: 0.25,
        })
        .expect("payload should serialize");
        assert_eq!(body, json!({"userId": "42", "finalReward": 0.25}));
    }
}
