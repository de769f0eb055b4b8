pub mod action;
pub mod agent_loop;
pub mod browser;
pub mod config;
pub mod error;
pub mod ground_truth;
pub mod logging;
pub mod plugins;
pub mod policy;
pub mod providers;
pub mod rate_limit;
pub mod scoring;
pub mod sources;
pub mod task;
pub mod templates;
pub mod types;

pub use action::{ActionKind, ActionPrecedence, BrowserAction, ScrollDirection};
pub use agent_loop::{AgentError, AgentEvent, AgentLoop, AgentRun, NavigationHook};
pub use browser::{BrowserObservation, BrowserSession, BLANK_PAGE};
pub use config::{ArenaConfig, SourceConfig, SourcesConfig};
pub use error::{ActionError, BrowserError, ConfigError, FetchError, LLMError};
pub use ground_truth::{
    CompositeTrigger,
    FetchStrategy,
    GroundTruthCollector,
    GroundTruthResult,
    GroundTruthState,
    GroundTruthTrigger,
    TriggerConfig,
    UrlPatternTrigger,
    UrlWithParamsTrigger,
};
pub use plugins::{
    hackernews::{FirebaseClient, HackerNewsApi, HackerNewsPlugin},
    EvalContext,
    ExternalUrlRegistry,
    Plugin,
};
pub use policy::{AgentPolicy, ParsedResponse, PromptError, RepairTier};
pub use providers::LLMProvider;
pub use rate_limit::RateLimiter;
pub use scoring::{parse_answers, EvaluationResult, Scorer, Subtask, SubtaskScore};
pub use task::{CompositeTask, StepOutcome, TrajectoryStep};
pub use templates::{
    GeneratedQuestion,
    MarketFeed,
    PriceFeed,
    PriceRatioTemplate,
    QuestionTemplate,
    TemplateRegistry,
    ValidationResult,
};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
