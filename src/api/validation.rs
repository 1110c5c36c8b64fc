use actix_web::HttpResponse;
use serde::Serialize;

/// Error envelope returned by every failing endpoint
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub fields: serde_json::Value,
}

impl ErrorResponse {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            fields: serde_json::json!({ "message": message.into() }),
        }
    }
}

/// Creates a configured JsonConfig with standardized error handling for the entire project
pub fn json_config() -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default().error_handler(|err, _req| {
        let response = match &err {
            actix_web_validator::Error::Validate(validation_errors) => {
                let mut fields = serde_json::Map::new();
                for (field, errors) in validation_errors.field_errors() {
                    let messages: Vec<String> = errors
                        .iter()
                        .map(|e| {
                            e.message
                                .as_ref()
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| format!("Validation error in field: {}", field))
                        })
                        .collect();
                    fields.insert(field.to_string(), serde_json::json!({ "errors": messages }));
                }
                ErrorResponse {
                    error: "Validation failed".to_string(),
                    fields: serde_json::Value::Object(fields),
                }
            }
            actix_web_validator::Error::Deserialize(de_err) => {
                let detail = de_err.to_string();
                let message = if detail.contains("EOF while parsing") {
                    "Request body is empty. Expected JSON payload"
                } else if detail.contains("unknown variant") {
                    "Invalid enum value. Check allowed values for this field"
                } else {
                    "Invalid JSON format"
                };
                ErrorResponse::new("Request validation failed", message)
            }
            _ => ErrorResponse::new("Validation failed", "Validation error"),
        };

        actix_web::error::InternalError::from_response(
            "",
            HttpResponse::BadRequest().json(response),
        )
        .into()
    })
}
