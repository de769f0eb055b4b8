use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    action::BrowserAction,
    browser::{BrowserObservation, BrowserSession, BLANK_PAGE},
    config::ArenaConfig,
    error::FetchError,
    policy::{AgentPolicy, PromptError},
    task::{CompositeTask, StepOutcome, TrajectoryStep},
    types::{CompletionRequest, TokenUsage},
    LLMProvider,
};

pub const DEFAULT_MAX_STEPS: usize = 30;
pub const LLM_ERROR_WAIT_SECONDS: f64 = 1.0;
pub const PARSE_FAILURE_WAIT_SECONDS: f64 = 0.5;

/// Raised only for defects in the built-in prompt templates. Collaborator
/// failures never abort a run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Called whenever an executed action lands on a different URL.
#[async_trait]
pub trait NavigationHook: Send + Sync {
    async fn on_navigation(&self, url: &str) -> Result<(), FetchError>;
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    StepRecorded(TrajectoryStep),
    Navigated { url: String },
    Completed { answer: Value },
    MaxStepsReached { steps: usize },
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub trajectory: Vec<TrajectoryStep>,
    pub final_answer: Option<Value>,
    /// `None` when no model call succeeded.
    pub usage: Option<TokenUsage>,
    pub max_steps_reached: bool,
    pub json_repairs: usize,
}

pub struct AgentLoop {
    session: Arc<dyn BrowserSession>,
    provider: Arc<dyn LLMProvider>,
    policy: AgentPolicy,
    max_steps: usize,
    start_url: String,
    llm_error_wait: f64,
    parse_failure_wait: f64,
    navigation_hook: Option<Arc<dyn NavigationHook>>,
    event_callback: Option<Arc<dyn Fn(&AgentEvent) + Send + Sync>>,
}

impl AgentLoop {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        provider: Arc<dyn LLMProvider>,
        policy: AgentPolicy,
    ) -> Self {
        Self {
            session,
            provider,
            policy,
            max_steps: DEFAULT_MAX_STEPS,
            start_url: BLANK_PAGE.to_string(),
            llm_error_wait: LLM_ERROR_WAIT_SECONDS,
            parse_failure_wait: PARSE_FAILURE_WAIT_SECONDS,
            navigation_hook: None,
            event_callback: None,
        }
    }

    pub fn from_config(
        session: Arc<dyn BrowserSession>,
        provider: Arc<dyn LLMProvider>,
        config: &ArenaConfig,
    ) -> Self {
        let policy = AgentPolicy::new(config.max_recent_steps).with_precedence(config.action_precedence);
        let mut agent = Self::new(session, provider, policy).with_max_steps(config.max_steps);
        agent.start_url = config.start_url.clone();
        agent.llm_error_wait = config.llm_error_wait_secs;
        agent.parse_failure_wait = config.parse_failure_wait_secs;
        agent
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = url.into();
        self
    }

    pub fn with_navigation_hook(mut self, hook: Arc<dyn NavigationHook>) -> Self {
        self.navigation_hook = Some(hook);
        self
    }

    pub fn with_event_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub async fn run(
        &self,
        task: &CompositeTask,
        model: &str,
        temperature: f32,
        seed: Option<u64>,
    ) -> Result<AgentRun, AgentError> {
        self.policy.reset_repair_count();
        let system_prompt = self.policy.build_system_prompt(task)?;
        info!(max_steps = self.max_steps, model, "starting agent loop");

        let mut obs = match self.session.goto(&self.start_url).await {
            Ok(obs) => obs,
            Err(err) => {
                warn!(error = %err, url = %self.start_url, "initial navigation failed");
                BrowserObservation::blank()
            }
        };

        let mut trajectory: Vec<TrajectoryStep> = Vec::new();
        let mut usage: Option<TokenUsage> = None;
        let mut final_answer: Option<Value> = None;

        for step_num in 0..self.max_steps {
            debug!(step = step_num + 1, max_steps = self.max_steps, url = %obs.url, "agent step");

            let current_obs = obs.clone();
            let prompt =
                self.policy
                    .build_step_prompt(&current_obs, &trajectory, step_num + 1, self.max_steps)?;

            let request = CompletionRequest::chat(model, system_prompt.as_str(), prompt.as_str())
                .with_temperature(temperature)
                .with_seed(seed);

            let response = match self.provider.complete(request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(step = step_num, error = %err, "model call failed");
                    let filler = BrowserAction::wait(self.llm_error_wait);
                    if let Some(next) = self.execute_filler(&filler).await {
                        obs = next;
                    }
                    self.record(
                        &mut trajectory,
                        TrajectoryStep {
                            step_num,
                            observation: current_obs,
                            thought: Some(format!("LLM error: {err}")),
                            action: filler,
                            outcome: StepOutcome::LlmError(err.to_string()),
                            prompt: Some(prompt),
                            raw_response: None,
                        },
                    );
                    continue;
                }
            };

            let total = usage.get_or_insert_with(TokenUsage::default);
            if let Some(reported) = &response.usage {
                total.accumulate(reported);
            }

            let raw = response.text().to_string();
            let (thought, action) = match self.policy.parse_response(&raw) {
                Some(parsed) => (parsed.thought, parsed.action),
                None => (None, None),
            };

            let Some(action) = action else {
                warn!(step = step_num, "could not decode an action, waiting");
                let filler = BrowserAction::wait(self.parse_failure_wait);
                if let Some(next) = self.execute_filler(&filler).await {
                    obs = next;
                }
                self.record(
                    &mut trajectory,
                    TrajectoryStep {
                        step_num,
                        observation: current_obs,
                        thought,
                        action: filler,
                        outcome: StepOutcome::ParseFailed,
                        prompt: Some(prompt),
                        raw_response: Some(raw),
                    },
                );
                continue;
            };

            if let BrowserAction::Stop { answer } = &action {
                info!(step = step_num, answer = %answer, "agent stopped");
                final_answer = Some(answer.clone());
                self.record(
                    &mut trajectory,
                    TrajectoryStep {
                        step_num,
                        observation: current_obs,
                        thought,
                        action,
                        outcome: StepOutcome::Completed,
                        prompt: Some(prompt),
                        raw_response: Some(raw),
                    },
                );
                break;
            }

            debug!(step = step_num, action = %action, "executing action");
            let outcome = match self.session.execute_action(&action).await {
                Ok(next) => {
                    let navigated = next.url != current_obs.url;
                    obs = next;
                    if navigated {
                        self.notify_navigation(&obs.url).await;
                    }
                    StepOutcome::Success
                }
                Err(err) => {
                    warn!(step = step_num, error = %err, "action failed");
                    StepOutcome::ActionFailed(err.to_string())
                }
            };

            self.record(
                &mut trajectory,
                TrajectoryStep {
                    step_num,
                    observation: current_obs,
                    thought,
                    action,
                    outcome,
                    prompt: Some(prompt),
                    raw_response: Some(raw),
                },
            );
        }

        let max_steps_reached = final_answer.is_none();
        match &final_answer {
            Some(answer) => self.emit(&AgentEvent::Completed {
                answer: answer.clone(),
            }),
            None => {
                warn!(max_steps = self.max_steps, "max steps reached without completion");
                self.emit(&AgentEvent::MaxStepsReached {
                    steps: trajectory.len(),
                });
            }
        }
        info!(steps = trajectory.len(), "agent loop finished");

        Ok(AgentRun {
            trajectory,
            final_answer,
            usage,
            max_steps_reached,
            json_repairs: self.policy.json_repair_count(),
        })
    }

    async fn execute_filler(&self, filler: &BrowserAction) -> Option<BrowserObservation> {
        match self.session.execute_action(filler).await {
            Ok(obs) => Some(obs),
            Err(err) => {
                debug!(error = %err, "filler wait failed");
                None
            }
        }
    }

    async fn notify_navigation(&self, url: &str) {
        self.emit(&AgentEvent::Navigated {
            url: url.to_string(),
        });
        if let Some(hook) = &self.navigation_hook {
            if let Err(err) = hook.on_navigation(url).await {
                warn!(error = %err, url, "navigation hook failed");
            }
        }
    }

    fn record(&self, trajectory: &mut Vec<TrajectoryStep>, step: TrajectoryStep) {
        if self.event_callback.is_some() {
            self.emit(&AgentEvent::StepRecorded(step.clone()));
        }
        trajectory.push(step);
    }

    fn emit(&self, event: &AgentEvent) {
        if let Some(callback) = &self.event_callback {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{error::BrowserError, providers::scripted::ScriptedProvider};

    /// Navigates by echoing goto URLs; fails clicks on selectors starting with `#missing`.
    struct EchoBrowser {
        current: Mutex<BrowserObservation>,
        executed: Mutex<Vec<BrowserAction>>,
    }

    impl EchoBrowser {
        fn new() -> Self {
            Self {
                current: Mutex::new(BrowserObservation::blank()),
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrowserSession for EchoBrowser {
        async fn goto(&self, url: &str) -> Result<BrowserObservation, BrowserError> {
            let obs = BrowserObservation::new(url, "", "");
            *self.current.lock().unwrap() = obs.clone();
            Ok(obs)
        }

        async fn execute_action(&self, action: &BrowserAction) -> Result<BrowserObservation, BrowserError> {
            self.executed.lock().unwrap().push(action.clone());
            match action {
                BrowserAction::Goto { url } => self.goto(url).await,
                BrowserAction::Click { selector } if selector.starts_with("#missing") => {
                    Err(BrowserError::Execution(format!("no element {selector}")))
                }
                _ => Ok(self.current.lock().unwrap().clone()),
            }
        }
    }

    fn goto_reply(url: &str) -> String {
        json!({"thought": "go", "action": {"type": "goto", "params": {"url": url}}}).to_string()
    }

    #[tokio::test]
    async fn stop_records_pre_decision_observation() {
        let browser = Arc::new(EchoBrowser::new());
        let provider = Arc::new(ScriptedProvider::from_responses([
            goto_reply("https://news.ycombinator.com/"),
            json!({"thought": "done", "action": {"type": "stop", "params": {"final": {"answers": {"answer1": "42"}}}}}).to_string(),
        ]));
        let agent = AgentLoop::new(browser.clone(), provider, AgentPolicy::default()).with_max_steps(5);

        let run = agent.run(&CompositeTask::new("find it"), "m", 0.0, Some(7)).await.unwrap();

        assert_eq!(run.trajectory.len(), 2);
        assert_eq!(run.trajectory[0].observation.url, BLANK_PAGE);
        let stop = &run.trajectory[1];
        assert_eq!(stop.outcome, StepOutcome::Completed);
        assert_eq!(stop.observation.url, "https://news.ycombinator.com/");
        assert_eq!(run.final_answer, Some(json!({"answers": {"answer1": "42"}})));
        assert!(!run.max_steps_reached);
        // stop is never executed
        assert_eq!(browser.executed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_actions_keep_prior_observation_and_continue() {
        let browser = Arc::new(EchoBrowser::new());
        let provider = Arc::new(ScriptedProvider::from_responses([
            goto_reply("https://stooq.com/"),
            json!({"action": {"type": "click", "params": {"selector": "#missing-link"}}}).to_string(),
            json!({"action": {"type": "scroll", "params": {}}}).to_string(),
        ]));
        let agent = AgentLoop::new(browser, provider, AgentPolicy::default()).with_max_steps(3);

        let run = agent.run(&CompositeTask::new("t"), "m", 0.0, None).await.unwrap();

        assert_eq!(run.trajectory.len(), 3);
        assert_eq!(
            run.trajectory[1].outcome,
            StepOutcome::ActionFailed("no element #missing-link".into())
        );
        assert_eq!(run.trajectory[2].observation.url, "https://stooq.com/");
        assert_eq!(run.trajectory[2].outcome, StepOutcome::Success);
        assert!(run.max_steps_reached);
        assert!(run.final_answer.is_none());
    }

    #[tokio::test]
    async fn llm_failures_become_wait_steps_and_usage_stays_none() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure("503 upstream");
        provider.push_failure("timeout");
        let agent = AgentLoop::new(Arc::new(EchoBrowser::new()), provider, AgentPolicy::default())
            .with_max_steps(2);

        let run = agent.run(&CompositeTask::new("t"), "m", 0.0, None).await.unwrap();

        assert_eq!(run.trajectory.len(), 2);
        for (i, step) in run.trajectory.iter().enumerate() {
            assert_eq!(step.step_num, i);
            assert_eq!(step.action, BrowserAction::wait(LLM_ERROR_WAIT_SECONDS));
            assert!(matches!(&step.outcome, StepOutcome::LlmError(cause) if cause.contains("provider error")));
        }
        assert!(run.usage.is_none());
    }

    #[tokio::test]
    async fn parse_failures_wait_and_count_repairs() {
        let provider = Arc::new(ScriptedProvider::from_responses(["no json here", "still nothing"]));
        let agent = AgentLoop::new(Arc::new(EchoBrowser::new()), provider, AgentPolicy::default())
            .with_max_steps(2);

        let run = agent.run(&CompositeTask::new("t"), "m", 0.0, None).await.unwrap();

        assert!(run
            .trajectory
            .iter()
            .all(|step| step.outcome == StepOutcome::ParseFailed
                && step.action == BrowserAction::wait(PARSE_FAILURE_WAIT_SECONDS)));
        assert_eq!(run.json_repairs, 2);
        assert_eq!(run.usage, Some(TokenUsage::default()));
    }

    #[tokio::test]
    async fn usage_sums_across_successful_calls() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_text(goto_reply("https://a.example/"), Some(TokenUsage::new(10, 2, 12)));
        provider.push_failure("flaky");
        provider.push_text(goto_reply("https://b.example/"), Some(TokenUsage::new(20, 3, 23)));
        provider.push_text(goto_reply("https://c.example/"), Some(TokenUsage::new(30, 4, 34)));
        let agent = AgentLoop::new(Arc::new(EchoBrowser::new()), provider, AgentPolicy::default())
            .with_max_steps(4);

        let run = agent.run(&CompositeTask::new("t"), "m", 0.0, None).await.unwrap();

        assert_eq!(run.usage, Some(TokenUsage::new(60, 9, 69)));
    }

    #[tokio::test]
    async fn navigation_hook_and_events_fire_on_url_change() {
        struct Recorder(Mutex<Vec<String>>);

        #[async_trait]
        impl NavigationHook for Recorder {
            async fn on_navigation(&self, url: &str) -> Result<(), FetchError> {
                self.0.lock().unwrap().push(url.to_string());
                Err(FetchError::NotFound("ignored".into()))
            }
        }

        let hook = Arc::new(Recorder(Mutex::new(Vec::new())));
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let provider = Arc::new(ScriptedProvider::from_responses([
            goto_reply("https://news.ycombinator.com/"),
            json!({"action": {"type": "wait", "params": {"seconds": 0}}}).to_string(),
            goto_reply("https://example.org/post"),
        ]));
        let agent = AgentLoop::new(Arc::new(EchoBrowser::new()), provider, AgentPolicy::default())
            .with_max_steps(3)
            .with_navigation_hook(hook.clone())
            .with_event_callback(move |event| events_clone.lock().unwrap().push(event.clone()));

        let run = agent.run(&CompositeTask::new("t"), "m", 0.0, None).await.unwrap();

        assert_eq!(run.trajectory.len(), 3);
        assert_eq!(
            *hook.0.lock().unwrap(),
            vec!["https://news.ycombinator.com/".to_string(), "https://example.org/post".to_string()]
        );
        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| matches!(e, AgentEvent::StepRecorded(_))).count(), 3);
        assert!(matches!(events.last(), Some(AgentEvent::MaxStepsReached { steps: 3 })));
    }

    #[tokio::test]
    async fn requests_carry_model_temperature_and_seed() {
        let provider = Arc::new(ScriptedProvider::from_responses([goto_reply("https://a.example/")]));
        let agent = AgentLoop::new(Arc::new(EchoBrowser::new()), provider.clone(), AgentPolicy::default())
            .with_max_steps(1);

        agent.run(&CompositeTask::new("t"), "gpt-test", 0.3, Some(11)).await.unwrap();

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-test");
        assert_eq!(requests[0].temperature, Some(0.3));
        assert_eq!(requests[0].seed, Some(11));
        assert_eq!(requests[0].messages.len(), 2);
    }
}
