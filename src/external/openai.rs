use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use super::LanguageModel;
use crate::{entities::Location, error::Error};

#[derive(Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub api_base: String,
    pub discovery_model: String,
    pub structuring_model: String,
    pub timeout: Duration,
}

impl fmt::Debug for OpenAIConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("discovery_model", &self.discovery_model)
            .field("structuring_model", &self.structuring_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

const STRUCTURING_INSTRUCTIONS: &str = "Extract every place named in the text. \
For each place return its name, street address, city, state or region, country, \
and its accurate latitude and longitude in decimal degrees. \
Use an empty string for an address field that does not apply.";

fn discovery_prompt(text: &str) -> String {
    format!(
        "Find up to 5 popular places that match this description: {}. \
         For each place give its name and full address, including the street, \
         city, state or region, and country.",
        text
    )
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: String,
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    response_format: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
    #[serde(default, skip_serializing)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationBatch {
    locations: Vec<Location>,
}

/// JSON schema the structuring call is constrained to.
pub fn locations_schema() -> Value {
    let text = json!({ "type": "string" });

    json!({
        "type": "object",
        "properties": {
            "locations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": text,
                        "address": text,
                        "city": text,
                        "state": text,
                        "country": text,
                        "coordinates": {
                            "type": "object",
                            "properties": {
                                "latitude": { "type": "number" },
                                "longitude": { "type": "number" }
                            },
                            "required": ["latitude", "longitude"],
                            "additionalProperties": false
                        }
                    },
                    "required": ["name", "address", "city", "state", "country", "coordinates"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["locations"],
        "additionalProperties": false
    })
}

/// Client for the OpenAI HTTP API: the Responses endpoint with web search for
/// discovery, Chat Completions with a strict JSON schema for structuring.
pub struct OpenAIClient {
    config: OpenAIConfig,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(config: OpenAIConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self { config, client })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, Error>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), path);

        let res = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status_code = res.status().as_u16();

        if status_code == 429 || status_code >= 500 {
            tracing::warn!(status_code, path, "upstream unavailable");
            return Err(Error::upstream_error());
        } else if status_code >= 400 {
            tracing::error!(status_code, path, "upstream rejected request");
            return Err(Error::upstream_rejected_error());
        } else if status_code != 200 {
            return Err(Error::upstream_error());
        }

        let text = res.text().await?;

        serde_json::from_str(&text).map_err(|err| {
            Error::malformed_output_error(format!("unexpected {} response: {}", path, err))
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    #[tracing::instrument(skip(self))]
    async fn discover_places(&self, text: &str) -> Result<String, Error> {
        let request = ResponsesRequest {
            model: &self.config.discovery_model,
            input: discovery_prompt(text),
            tools: vec![json!({ "type": "web_search_preview" })],
        };

        let response: ResponsesResponse = self.post("responses", &request).await?;

        output_text(response)
    }

    #[tracing::instrument(skip(self, description))]
    async fn structure_locations(&self, description: &str) -> Result<Vec<Location>, Error> {
        let request = ChatRequest {
            model: &self.config.structuring_model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: Some(STRUCTURING_INSTRUCTIONS.into()),
                    refusal: None,
                },
                ChatMessage {
                    role: "user".into(),
                    content: Some(description.into()),
                    refusal: None,
                },
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "locations",
                    "strict": true,
                    "schema": locations_schema()
                }
            }),
        };

        let response: ChatResponse = self.post("chat/completions", &request).await?;

        structured_locations(response)
    }
}

fn output_text(response: ResponsesResponse) -> Result<String, Error> {
    let text = response
        .output
        .into_iter()
        .filter(|item| item.kind == "message")
        .flat_map(|item| item.content)
        .filter(|content| content.kind == "output_text")
        .filter_map(|content| content.text)
        .collect::<Vec<_>>()
        .join("\n");

    if text.trim().is_empty() {
        return Err(Error::malformed_output_error("discovery returned no text"));
    }

    Ok(text)
}

fn structured_locations(response: ChatResponse) -> Result<Vec<Location>, Error> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::malformed_output_error("structuring returned no choices"))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(Error::malformed_output_error(format!(
            "structuring refused: {}",
            refusal
        )));
    }

    if choice.finish_reason.as_deref() == Some("length") {
        return Err(Error::malformed_output_error("structuring output truncated"));
    }

    let content = choice
        .message
        .content
        .ok_or_else(|| Error::malformed_output_error("structuring returned no content"))?;

    let batch: LocationBatch = serde_json::from_str(&content)
        .map_err(|err| Error::malformed_output_error(format!("schema mismatch: {}", err)))?;

    Ok(batch.locations)
}

#[test]
fn discovery_text_joins_message_output() {
    let response: ResponsesResponse = serde_json::from_value(json!({
        "id": "resp_1",
        "output": [
            { "type": "web_search_call", "id": "ws_1", "status": "completed" },
            {
                "type": "message",
                "role": "assistant",
                "content": [
                    {
                        "type": "output_text",
                        "text": "1. The Eiffel Tower, Champ de Mars, Paris, France.",
                        "annotations": []
                    },
                    {
                        "type": "output_text",
                        "text": "2. Louvre Museum, Rue de Rivoli, Paris, France.",
                        "annotations": []
                    }
                ]
            }
        ]
    }))
    .unwrap();

    let text = output_text(response).unwrap();

    assert!(text.contains("Eiffel Tower"));
    assert!(text.contains("Louvre Museum"));
    assert!(!text.contains("ws_1"));
}

#[test]
fn discovery_without_text_is_malformed() {
    let response: ResponsesResponse = serde_json::from_value(json!({
        "output": [{ "type": "web_search_call", "id": "ws_1", "status": "completed" }]
    }))
    .unwrap();

    assert!(output_text(response).unwrap_err().is_malformed_output_error());
}

#[test]
fn structured_output_for_paris_landmarks() {
    let content = json!({
        "locations": [
            {
                "name": "Eiffel Tower",
                "address": "Champ de Mars, 5 Avenue Anatole France",
                "city": "Paris",
                "state": "Île-de-France",
                "country": "France",
                "coordinates": { "latitude": 48.8584, "longitude": 2.2945 }
            },
            {
                "name": "Louvre Museum",
                "address": "Rue de Rivoli",
                "city": "Paris",
                "state": "Île-de-France",
                "country": "France",
                "coordinates": { "latitude": 48.8606, "longitude": 2.3376 }
            }
        ]
    });

    let response: ChatResponse = serde_json::from_value(json!({
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content.to_string(), "refusal": null },
            "finish_reason": "stop"
        }]
    }))
    .unwrap();

    let locations = structured_locations(response).unwrap();

    assert_eq!(locations.len(), 2);
    assert_eq!(locations[0].name, "Eiffel Tower");
    assert_eq!(locations[1].coordinates.longitude, 2.3376);
}

#[test]
fn structured_output_schema_mismatch() {
    let content = json!({
        "locations": [{
            "name": "Eiffel Tower",
            "city": "Paris",
            "coordinates": { "latitude": "north", "longitude": 2.2945 }
        }]
    });

    let response: ChatResponse = serde_json::from_value(json!({
        "choices": [{
            "message": { "role": "assistant", "content": content.to_string() },
            "finish_reason": "stop"
        }]
    }))
    .unwrap();

    let err = structured_locations(response).unwrap_err();
    assert!(err.is_malformed_output_error());
    assert!(!err.is_transient());
}

#[test]
fn structured_output_refusal() {
    let response: ChatResponse = serde_json::from_value(json!({
        "choices": [{
            "message": { "role": "assistant", "content": null, "refusal": "I can't help with that." },
            "finish_reason": "stop"
        }]
    }))
    .unwrap();

    assert!(structured_locations(response)
        .unwrap_err()
        .is_malformed_output_error());
}

#[test]
fn schema_requires_every_location_field() {
    let schema = locations_schema();
    let required = &schema["properties"]["locations"]["items"]["required"];

    for field in ["name", "address", "city", "state", "country", "coordinates"] {
        assert!(required
            .as_array()
            .unwrap()
            .contains(&Value::String(field.into())));
    }
}

#[test]
fn api_key_is_not_logged() {
    let config = OpenAIConfig {
        api_key: "sk-secret".into(),
        api_base: "https://api.openai.com/v1".into(),
        discovery_model: "gpt-4o".into(),
        structuring_model: "gpt-4o-mini".into(),
        timeout: Duration::from_secs(30),
    };

    assert!(!format!("{:?}", config).contains("sk-secret"));
}
