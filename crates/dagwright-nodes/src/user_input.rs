use std::io::IsTerminal;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use dagwright_core::{DagError, Node, Payload, Result};

/// Prompts the user for a choice or free-form text.
///
/// Answers supplied in the input (`selected_option`, `user_input`,
/// `confirmed`) are echoed back without prompting, which is how tests and
/// programmatic callers drive branching graphs.
pub struct UserInputNode {
    id: String,
    prompt: String,
    options: Vec<String>,
    default: Option<String>,
    interactive: bool,
}

impl UserInputNode {
    /// Interactive when stdin is a terminal.
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            options: Vec::new(),
            default: None,
            interactive: std::io::stdin().is_terminal(),
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    fn provided(input: &Payload) -> Option<Payload> {
        let confirmed = input.get("confirmed").cloned().unwrap_or(json!(false));

        if let Some(selected) = input.get("selected_option") {
            let mut out = Payload::new();
            out.insert(
                "user_input".into(),
                input.get("user_input").cloned().unwrap_or(json!("")),
            );
            out.insert("confirmed".into(), confirmed);
            out.insert("selected_option".into(), selected.clone());
            out.insert("success".into(), json!(true));
            return Some(out);
        }

        input.get("user_input").map(|answer| {
            let mut out = Payload::new();
            out.insert("user_input".into(), answer.clone());
            out.insert("confirmed".into(), confirmed);
            out.insert("success".into(), json!(true));
            out
        })
    }

    fn fallback(&self) -> Payload {
        let Some(default) = &self.default else {
            warn!(node_id = %self.id, "No answer available for non-interactive prompt");
            return failed(format!("No input available for prompt: {}", self.prompt));
        };

        let mut out = answered(default);
        if let Some(idx) = self.options.iter().position(|o| o == default) {
            out.insert("selected_option".into(), json!(idx));
        }
        out
    }

    async fn ask(&self) -> Result<Payload> {
        let prompt = self.prompt.clone();
        let options = self.options.clone();
        let default = self.default.clone();

        tokio::task::spawn_blocking(move || prompt_terminal(&prompt, &options, default.as_deref()))
            .await
            .map_err(|e| DagError::NodeExecution {
                node: self.id.clone(),
                message: format!("prompt task failed: {}", e),
            })
    }
}

fn prompt_terminal(prompt: &str, options: &[String], default: Option<&str>) -> Payload {
    if !options.is_empty() {
        let start = default
            .and_then(|d| options.iter().position(|o| o == d))
            .unwrap_or(0);
        return match dialoguer::Select::new()
            .with_prompt(prompt)
            .items(options)
            .default(start)
            .interact_opt()
        {
            Ok(Some(idx)) => {
                let mut out = answered(&options[idx]);
                out.insert("selected_option".into(), json!(idx));
                out
            }
            Ok(None) | Err(_) => failed("User cancelled input".into()),
        };
    }

    let mut input = dialoguer::Input::<String>::new()
        .with_prompt(prompt)
        .allow_empty(true);
    if let Some(d) = default {
        input = input.default(d.to_string());
    }
    match input.interact_text() {
        Ok(response) => {
            let response = response.trim();
            match default {
                Some(d) if response.is_empty() => answered(d),
                _ => answered(response),
            }
        }
        Err(_) => failed("User cancelled input".into()),
    }
}

fn answered(response: &str) -> Payload {
    let mut out = Payload::new();
    out.insert("user_input".into(), json!(response));
    out.insert("confirmed".into(), json!(is_confirmation(response)));
    out.insert("success".into(), json!(true));
    out
}

fn failed(error: String) -> Payload {
    let mut out = Payload::new();
    out.insert("user_input".into(), Value::Null);
    out.insert("confirmed".into(), json!(false));
    out.insert("success".into(), json!(false));
    out.insert("error".into(), json!(error));
    out
}

/// "yes", "y", "true" and "1" count as confirmation, case-insensitively.
pub fn is_confirmation(response: &str) -> bool {
    matches!(
        response.trim().to_lowercase().as_str(),
        "yes" | "y" | "true" | "1"
    )
}

impl Node for UserInputNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "user_input"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            if let Some(out) = Self::provided(&input) {
                debug!(node_id = %self.id, "Using provided answer");
                return Ok(out);
            }
            if self.interactive {
                self.ask().await
            } else {
                Ok(self.fallback())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagwright_test_utils::payload;

    fn node() -> UserInputNode {
        UserInputNode::new("ask", "Continue?")
            .with_options(vec!["approve".into(), "reject".into()])
            .interactive(false)
    }

    #[tokio::test]
    async fn test_selected_option_echoed() {
        let out = node()
            .execute(payload(json!({"selected_option": 1})))
            .await
            .unwrap();
        assert_eq!(out["selected_option"], json!(1));
        assert_eq!(out["user_input"], json!(""));
        assert_eq!(out["confirmed"], json!(false));
        assert_eq!(out["success"], json!(true));
    }

    #[tokio::test]
    async fn test_user_input_echoed() {
        let out = node()
            .execute(payload(json!({"user_input": "ship it", "confirmed": true})))
            .await
            .unwrap();
        assert_eq!(out["user_input"], json!("ship it"));
        assert_eq!(out["confirmed"], json!(true));
        assert!(out.get("selected_option").is_none());
    }

    #[tokio::test]
    async fn test_non_interactive_default() {
        let out = node()
            .with_default("reject")
            .execute(Payload::new())
            .await
            .unwrap();
        assert_eq!(out["user_input"], json!("reject"));
        assert_eq!(out["selected_option"], json!(1));
        assert_eq!(out["success"], json!(true));
    }

    #[tokio::test]
    async fn test_non_interactive_without_default_fails() {
        let out = node().execute(Payload::new()).await.unwrap();
        assert_eq!(out["success"], json!(false));
        assert_eq!(out["user_input"], Value::Null);
        assert!(out["error"].as_str().unwrap().contains("Continue?"));
    }

    #[test]
    fn test_confirmation_words() {
        for yes in ["yes", "Y", "true", "1", " YES "] {
            assert!(is_confirmation(yes), "{yes}");
        }
        for no in ["no", "", "nope", "0"] {
            assert!(!is_confirmation(no), "{no}");
        }
    }
}
