pub mod budget;
pub mod compaction;
pub mod config;
pub mod error;
pub mod estimate;
pub mod events;
pub mod handle;
pub mod ledger;
pub mod provider;
pub mod session;
pub mod truncate;
pub mod types;

pub use budget::{BudgetSnapshot, BudgetTracker, CompactionSignal, TurnLog, TurnUsage};
pub use compaction::{
    CompactionEngine, CompactionOutcome, CompactionPlan, CompactionReport, CompactionState,
    ProviderSummarizer, Summarizer, SUMMARY_PROMPT,
};
pub use config::{ContextConfig, WindowConfig};
pub use error::{ContextError, EstimationError, InferenceError};
pub use estimate::TokenEstimator;
pub use events::BudgetEvent;
pub use handle::{AgentClient, AppendReceipt, RejectionReport, SessionBuilder, SessionHandle};
pub use ledger::{CompactionMetadata, ContextItem, ItemKind, Ledger};
pub use provider::{AnthropicProvider, InferenceProvider};
pub use session::{FileSessionStore, NoSessionStore, SessionCheckpoint, SessionStore};
pub use truncate::{truncate, truncate_binary, Truncated, TruncationCaps};
pub use types::{GenerateRequest, GenerateResponse, Segment, Usage};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    // --- Mock Provider ---

    #[derive(Clone)]
    struct MockProvider {
        responses: Arc<Mutex<VecDeque<Result<GenerateResponse, InferenceError>>>>,
        requests: Arc<Mutex<Vec<GenerateRequest>>>,
    }

    impl MockProvider {
        fn new(responses: Vec<GenerateResponse>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into_iter().map(Ok).collect())),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_error(responses: Vec<GenerateResponse>, error: InferenceError) -> Self {
            let provider = Self::new(responses);
            provider.responses.try_lock().unwrap().push_back(Err(error));
            provider
        }
    }

    #[async_trait]
    impl InferenceProvider for MockProvider {
        async fn generate(
            &self,
            request: GenerateRequest,
        ) -> Result<GenerateResponse, InferenceError> {
            self.requests.lock().await.push(request);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(InferenceError::Request(
                    "no more mock responses".into(),
                )))
        }
    }

    fn text_response(text: &str, input_tokens: u32, output_tokens: u32) -> GenerateResponse {
        GenerateResponse {
            text: text.into(),
            usage: Usage {
                input_tokens,
                output_tokens,
            },
        }
    }

    fn config() -> WindowConfig {
        WindowConfig::default()
            .with_context_window(2_000)
            .with_reserved_output_fraction(0.10)
            .with_compaction_threshold(0.70)
            .with_retention_budget(900)
    }

    /// One agent turn: send the ledger, record what the backend billed, and
    /// store the reply.
    async fn run_turn(
        handle: &SessionHandle,
        provider: &MockProvider,
        prompt: &str,
    ) -> Result<AppendReceipt, InferenceError> {
        handle
            .append_item(ItemKind::UserMessage, "user", prompt)
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        let response = provider
            .generate(GenerateRequest {
                model: "mock".into(),
                max_tokens: handle.config().reserved_tokens(),
                system: None,
                segments: handle.segments(),
            })
            .await?;
        handle.record_turn_usage(response.usage);
        handle
            .append_item(ItemKind::AssistantMessage, "assistant", response.text)
            .map_err(|e| InferenceError::Request(e.to_string()))
    }

    #[tokio::test]
    async fn agent_loop_compacts_through_the_same_backend() {
        let provider = MockProvider::new(vec![
            text_response(&"a".repeat(2_000), 400, 500),
            text_response(&"b".repeat(3_200), 1_000, 800),
            text_response("User wants a parser fix; grep found src/parser.rs:10.", 1_200, 20),
        ]);
        let handle = SessionBuilder::new(ProviderSummarizer::new(provider.clone(), "mock"))
            .with_config(config())
            .build()
            .unwrap();

        let first = run_turn(&handle, &provider, "fix the parser").await.unwrap();
        assert!(first.signal.is_none());
        handle
            .append_tool_output("grep", "src/parser.rs:10: fn parse()".as_bytes())
            .unwrap();
        let second = run_turn(&handle, &provider, "and the lexer too").await.unwrap();
        // 500 + 800 assistant tokens plus prompts, against a 1260-token threshold.
        assert!(second.signal.is_some());

        let CompactionOutcome::Compacted(report) =
            handle.request_compaction_if_needed().await.unwrap()
        else {
            panic!("expected a compaction");
        };
        assert!(report.tokens_after < report.tokens_before);
        assert!(!handle.snapshot().signal_latched);

        let requests = provider.requests.lock().await;
        assert_eq!(requests.len(), 3);
        // The summarization request carries the first exchange only; the
        // tool output onwards fits in the retention budget.
        let summary_request = &requests[2];
        assert_eq!(summary_request.segments.len(), 1);
        assert!(summary_request.segments[0].text.contains("[user]: fix the parser"));
        assert!(!summary_request.segments[0].text.contains("[tool:grep]"));
        assert!(!summary_request.segments[0].text.contains("bbbb"));

        let history = handle.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].kind(), ItemKind::Summary);
        assert_eq!(history[1].role(), "tool:grep");
        assert_eq!(history[3].content(), "b".repeat(3_200));

        let turns = handle.turns();
        assert_eq!(turns.len(), 2);
        assert!(turns.turns()[1].compaction);
    }

    #[tokio::test]
    async fn backend_failure_during_compaction_keeps_the_session() {
        let provider = MockProvider::with_error(
            vec![text_response(&"a".repeat(5_200), 10, 1_300)],
            InferenceError::ApiError {
                status: 500,
                body: "internal error".into(),
            },
        );
        let handle = SessionBuilder::new(ProviderSummarizer::new(provider.clone(), "mock"))
            .with_config(config())
            .build()
            .unwrap();

        let receipt = run_turn(&handle, &provider, "write a long essay").await.unwrap();
        assert!(receipt.signal.is_some());
        let before = handle.history();

        let err = handle.request_compaction_if_needed().await.unwrap_err();
        assert!(matches!(err, ContextError::CompactionFailed { .. }));
        assert_eq!(handle.history(), before);
        assert!(handle.snapshot().signal_latched);
    }

    #[tokio::test]
    async fn sub_agent_shares_the_ledger() {
        let provider = MockProvider::new(vec![]);
        let handle = SessionBuilder::new(ProviderSummarizer::new(provider, "mock"))
            .with_config(config())
            .build()
            .unwrap();
        let researcher = handle.agent("researcher");

        handle.append_item(ItemKind::UserMessage, "user", "look into it").unwrap();
        researcher
            .append_message(ItemKind::AssistantMessage, "found three call sites")
            .unwrap();
        researcher.append_tool_output("grep", b"a.rs:1\nb.rs:2\nc.rs:3").unwrap();

        let roles: Vec<String> = handle.history().iter().map(|i| i.role().to_string()).collect();
        assert_eq!(roles, ["user", "researcher:assistant", "tool:researcher:grep"]);
        assert_eq!(researcher.snapshot(), handle.snapshot());
        assert_eq!(handle.snapshot().item_count, 3);
    }
}
