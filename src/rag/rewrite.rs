//! 질의 재작성 - 대화 히스토리를 반영한 독립적 검색 질의 생성
//!
//! 멀티턴 대화에서 "그건 어떻게 설정해?" 같은 후속 질문을 히스토리의
//! 맥락으로 풀어낸 검색 질의로 바꿉니다. 재작성은 best-effort 보강일
//! 뿐이므로 실패해도 파이프라인은 원래 질문으로 계속 진행합니다.

use crate::config::Settings;
use crate::llm::{ChatMessage, GenerationProvider, GenerationRequest};

use super::prompt;

/// 검색 질의 재작성
///
/// 히스토리가 비어 있거나 재작성이 비활성화면 LLM 호출 없이 원래
/// 질문을 그대로 반환합니다 (비용/지연 단락). 그 외에는 히스토리 윈도우
/// 뒤에 현재 질문 원문을 담은 지시 메시지를 붙여 재작성 예산으로
/// 생성을 호출합니다.
///
/// # Arguments
/// * `history` - 이미 윈도우가 적용된 히스토리 (오래된 것부터)
pub(crate) async fn rewrite_query(
    llm: &dyn GenerationProvider,
    settings: &Settings,
    question: &str,
    history: &[ChatMessage],
) -> String {
    if history.is_empty() || !settings.enable_query_rewriting {
        return question.to_string();
    }

    let mut messages = history.to_vec();
    messages.push(ChatMessage::user(prompt::build_rewrite_instruction(
        question,
    )));

    let request = GenerationRequest {
        system: prompt::REWRITE_SYSTEM_PROMPT.to_string(),
        messages,
        max_tokens: settings.rewrite_max_tokens,
        temperature: settings.rewrite_temperature,
    };

    match llm.generate(request).await {
        Ok(response) => match response.first_text() {
            Some(rewritten) => {
                tracing::debug!("Rewrote query: {:?} -> {:?}", question, rewritten);
                rewritten.to_string()
            }
            None => {
                tracing::warn!("Query rewriting produced no text, using original question");
                question.to_string()
            }
        },
        Err(e) => {
            tracing::warn!("Query rewriting failed ({}), using original question", e);
            question.to_string()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::llm::{GenerationResponse, LlmError, TokenStream};

    use super::*;

    /// 호출 횟수를 기록하는 스파이 프로바이더
    struct SpyLlm {
        segments: Vec<String>,
        fail: bool,
        calls: AtomicUsize,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl SpyLlm {
        fn returning(segments: Vec<&str>) -> Self {
            Self {
                segments: segments.into_iter().map(String::from).collect(),
                fail: false,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                segments: vec![],
                fail: true,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationProvider for SpyLlm {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request);

            if self.fail {
                return Err(LlmError::Transport("connection refused".to_string()));
            }
            Ok(GenerationResponse {
                segments: self.segments.clone(),
            })
        }

        async fn generate_stream(
            &self,
            _request: GenerationRequest,
        ) -> Result<TokenStream, LlmError> {
            unimplemented!("rewriting never streams")
        }

        fn name(&self) -> &str {
            "spy"
        }
    }

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("What is the indexer?"),
            ChatMessage::assistant("The indexer chunks markdown files."),
        ]
    }

    #[tokio::test]
    async fn test_empty_history_is_pure_passthrough() {
        let llm = SpyLlm::returning(vec!["should not be used"]);
        let settings = Settings::default();

        let query = rewrite_query(&llm, &settings, "what is this?", &[]).await;

        assert_eq!(query, "what is this?");
        // 단락 경로에서는 생성 포트 호출이 전혀 없어야 함
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_rewriting_is_passthrough() {
        let llm = SpyLlm::returning(vec!["should not be used"]);
        let mut settings = Settings::default();
        settings.enable_query_rewriting = false;

        let query = rewrite_query(&llm, &settings, "how do I configure it?", &history()).await;

        assert_eq!(query, "how do I configure it?");
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rewrites_with_history() {
        let llm = SpyLlm::returning(vec!["how do I configure the markdown indexer?"]);
        let settings = Settings::default();

        let query = rewrite_query(&llm, &settings, "how do I configure it?", &history()).await;

        assert_eq!(query, "how do I configure the markdown indexer?");
        assert_eq!(llm.call_count(), 1);

        let request = llm.last_request.lock().unwrap().take().unwrap();
        // 히스토리 2건 + 지시 메시지 1건, 재작성 예산 사용
        assert_eq!(request.messages.len(), 3);
        assert!(request.messages[2]
            .content
            .contains("Question: how do I configure it?"));
        assert_eq!(request.max_tokens, settings.rewrite_max_tokens);
        assert_eq!(request.system, prompt::REWRITE_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn test_empty_response_falls_back_to_original() {
        let llm = SpyLlm::returning(vec!["  ", ""]);
        let settings = Settings::default();

        let query = rewrite_query(&llm, &settings, "original question", &history()).await;

        assert_eq!(query, "original question");
    }

    #[tokio::test]
    async fn test_error_falls_back_to_original() {
        let llm = SpyLlm::failing();
        let settings = Settings::default();

        let query = rewrite_query(&llm, &settings, "original question", &history()).await;

        assert_eq!(query, "original question");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_uses_first_nonempty_segment() {
        let llm = SpyLlm::returning(vec!["", "rewritten query", "trailing noise"]);
        let settings = Settings::default();

        let query = rewrite_query(&llm, &settings, "q?", &history()).await;

        assert_eq!(query, "rewritten query");
    }
}
