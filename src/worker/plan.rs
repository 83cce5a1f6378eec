//! Turning a task request into an ordered list of actions.

use async_trait::async_trait;
use regex::Regex;

use crate::error::PlanError;
use crate::session::Action;
use crate::tasks::model::{MAX_STEPS, TaskRequest};

/// Produces the actions a task will execute.
///
/// The runner only sees this trait, so a model-backed planner can replace
/// `DirectPlanner` without touching execution.
#[async_trait]
pub trait StepPlanner: Send + Sync {
    async fn plan(&self, request: &TaskRequest) -> Result<Vec<Action>, PlanError>;
}

/// Plans without interpretation: explicit steps run as given, otherwise the
/// start URL (or the first URL in the instruction) is opened and captured.
pub struct DirectPlanner {
    url_pattern: Regex,
}

impl DirectPlanner {
    pub fn new() -> Self {
        Self {
            url_pattern: Regex::new(r#"https?://[^\s"'<>]+"#).expect("URL pattern is valid"),
        }
    }

    /// First http(s) URL mentioned in free text, without trailing punctuation.
    pub fn find_url(&self, text: &str) -> Option<String> {
        self.url_pattern.find(text).map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']'])
                .to_string()
        })
    }
}

impl Default for DirectPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepPlanner for DirectPlanner {
    async fn plan(&self, request: &TaskRequest) -> Result<Vec<Action>, PlanError> {
        if !request.steps.is_empty() {
            if request.steps.len() > MAX_STEPS {
                return Err(PlanError::TooManySteps {
                    count: request.steps.len(),
                    max: MAX_STEPS,
                });
            }
            return Ok(request.steps.clone());
        }

        let url = request
            .url
            .clone()
            .or_else(|| self.find_url(&request.instruction))
            .ok_or(PlanError::NoActions)?;

        Ok(vec![Action::Navigate { url }, Action::Screenshot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_steps_win() {
        let steps = vec![
            Action::Navigate {
                url: "https://example.com".into(),
            },
            Action::Click {
                selector: "#more".into(),
            },
        ];
        let request = TaskRequest::new("do it")
            .with_url("https://ignored.example")
            .with_steps(steps.clone());
        assert_eq!(DirectPlanner::new().plan(&request).await.unwrap(), steps);
    }

    #[tokio::test]
    async fn start_url_becomes_navigate_and_capture() {
        let request = TaskRequest::new("look around").with_url("https://example.com/a");
        let plan = DirectPlanner::new().plan(&request).await.unwrap();
        assert_eq!(
            plan,
            vec![
                Action::Navigate {
                    url: "https://example.com/a".into()
                },
                Action::Screenshot
            ]
        );
    }

    #[tokio::test]
    async fn url_found_in_instruction() {
        let request = TaskRequest::new("Open https://docs.rs/tokio, then take a screenshot.");
        let plan = DirectPlanner::new().plan(&request).await.unwrap();
        assert_eq!(
            plan[0],
            Action::Navigate {
                url: "https://docs.rs/tokio".into()
            }
        );
    }

    #[tokio::test]
    async fn nothing_to_do() {
        let request = TaskRequest::new("find me a good restaurant");
        let err = DirectPlanner::new().plan(&request).await.unwrap_err();
        assert!(matches!(err, PlanError::NoActions));
    }

    #[test]
    fn trims_trailing_punctuation() {
        let planner = DirectPlanner::new();
        assert_eq!(
            planner.find_url("(see http://example.com/x).").as_deref(),
            Some("http://example.com/x")
        );
        assert_eq!(planner.find_url("no links here"), None);
    }
}
