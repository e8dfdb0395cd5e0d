//! Push notifications through Pushover.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::base_tool::{extract_argument, BaseTool, EnvVar, ToolError};

const PUSHOVER_ENDPOINT: &str = "https://api.pushover.net/1/messages.json";

/// Sends a push notification to the operator.
///
/// Needs `PUSHOVER_USER` and `PUSHOVER_TOKEN`.
#[derive(Debug, Clone)]
pub struct PushNotificationTool {
    user: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
}

impl PushNotificationTool {
    pub fn new() -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        let [user, token] = Self::vars();
        Ok(Self {
            user: user.read(),
            token: token.read(),
            client,
        })
    }

    pub fn with_credentials(mut self, user: impl Into<String>, token: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.token = Some(token.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        self.user.is_some() && self.token.is_some()
    }

    fn vars() -> [EnvVar; 2] {
        [
            EnvVar::new("PUSHOVER_USER", "Pushover user key"),
            EnvVar::new("PUSHOVER_TOKEN", "Pushover application token"),
        ]
    }
}

#[async_trait]
impl BaseTool for PushNotificationTool {
    fn name(&self) -> &str {
        "push"
    }

    fn description(&self) -> &str {
        "Send a short push notification to the user. Input: {\"message\": \"<text>\"}."
    }

    fn env_vars(&self) -> Vec<EnvVar> {
        Self::vars().to_vec()
    }

    async fn run(&self, input: &str) -> Result<String, ToolError> {
        let (Some(user), Some(token)) = (self.user.as_deref(), self.token.as_deref()) else {
            return Err(ToolError::fatal("PUSHOVER_USER / PUSHOVER_TOKEN are not set"));
        };
        let message = extract_argument(input, &["message", "text"]);
        if message.is_empty() {
            return Err(ToolError::invalid_input("notification message is empty"));
        }

        log::info!("push notification: {}", message);
        let response = self
            .client
            .post(PUSHOVER_ENDPOINT)
            .json(&json!({"token": token, "user": user, "message": message}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::from_status(status, &body));
        }
        Ok("Notification sent.".to_string())
    }
}
