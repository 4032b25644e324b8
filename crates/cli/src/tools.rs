//! Demo tools served by `toolwire serve` and `toolwire demo`.

use mcp::{HandlerError, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

pub const SECRET_WORDS: [&str; 3] = ["apple", "banana", "cherry"];

#[derive(Debug, Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct AddOutput {
    result: i64,
}

#[derive(Debug, Deserialize)]
struct WeatherParams {
    city: String,
}

/// Build the registry with `add`, `get_secret_word` and `get_current_weather`.
pub fn registry(http: reqwest::Client, weather_base: Url) -> mcp::Result<ToolRegistry> {
    let registry = ToolRegistry::new();

    registry.register(
        ToolDescriptor::new(
            "add",
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "integer" },
                    "b": { "type": "integer" }
                },
                "required": ["a", "b"]
            }),
        )
        .with_description("Add two integers")
        .with_output_schema(json!({
            "type": "object",
            "properties": { "result": { "type": "integer" } },
            "required": ["result"]
        })),
        ToolHandler::typed(|p: AddParams, _ctx: ToolContext| async move {
            Ok::<_, HandlerError>(AddOutput {
                result: p.a.checked_add(p.b).ok_or("integer overflow")?,
            })
        }),
    )?;

    registry.register(
        ToolDescriptor::new("get_secret_word", json!({ "type": "object" }))
            .with_description("Get a secret word"),
        ToolHandler::blocking(|_| Ok(json!({ "secret_word": secret_word() }))),
    )?;

    registry.register(
        ToolDescriptor::new(
            "get_current_weather",
            json!({
                "type": "object",
                "properties": {
                    "city": { "type": "string", "minLength": 1 }
                },
                "required": ["city"]
            }),
        )
        .with_description("Get the current weather for a city"),
        ToolHandler::typed(move |p: WeatherParams, _ctx: ToolContext| {
            let http = http.clone();
            let url = weather_url(&weather_base, &p.city);
            async move {
                let url = url?;
                tracing::debug!(%url, "fetching weather");
                let body = http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                Ok::<Value, HandlerError>(json!({ "weather": body }))
            }
        }),
    )?;

    Ok(registry)
}

fn secret_word() -> &'static str {
    SECRET_WORDS[rand::rng().random_range(0..SECRET_WORDS.len())]
}

/// Append `city` as a single path segment of `base`.
fn weather_url(base: &Url, city: &str) -> Result<Url, HandlerError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| format!("weather URL cannot take a path: {base}"))?
        .pop_if_empty()
        .push(city);
    Ok(url)
}
