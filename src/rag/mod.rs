//! RAG 파이프라인 - 검색과 생성의 결합
//!
//! 질문 → 질의 재작성 → 벡터 검색 → 그라운딩된 답변 생성의 단계를
//! 엮습니다. 각 단계는 앞 단계의 출력에 데이터 의존하므로 엄격히
//! 순차 실행됩니다 (검색이 끝나기 전에 생성이 시작되면 그라운딩이
//! 깨집니다).
//!
//! 파이프라인 자체는 상태를 갖지 않습니다. 세 포트(임베딩/벡터
//! 저장소/생성)는 시작 시점에 명시적으로 주입되며, 호출마다 외부에서
//! 전달된 히스토리만 읽습니다.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Settings;
use crate::embedding::{EmbeddingProvider, EmbeddingTask};
use crate::llm::{ChatMessage, GenerationProvider, GenerationRequest, LlmError};
use crate::store::VectorStore;

pub mod prompt;

mod rewrite;

/// 스트리밍 채널 용량 (생산자가 소비자보다 한 이벤트 이상 앞서지 않음)
const STREAM_CHANNEL_CAPACITY: usize = 1;

// ============================================================================
// Types
// ============================================================================

/// 답변에 사용된 검색 결과
///
/// 스코어는 `1 - 코사인 거리`로, 높을수록 유사합니다. 목록은 항상
/// 유사도 순(최고 매치가 앞)으로 정렬되어 있습니다.
#[derive(Debug, Clone)]
pub struct Source {
    /// 원본 파일 경로
    pub file_path: String,
    /// 섹션 제목
    pub section: String,
    /// 청크 텍스트
    pub text: String,
    /// 유사도 스코어 (1 - 거리)
    pub score: f32,
}

/// RAG 파이프라인의 답변
#[derive(Debug, Clone)]
pub struct Answer {
    /// 답변 텍스트 (항상 비어 있지 않음)
    pub text: String,
    /// 사용된 소스 (유사도 순)
    pub sources: Vec<Source>,
}

/// 스트리밍 답변 이벤트
///
/// 소스 이벤트가 항상 첫 번째로, 그 뒤에 텍스트 조각이 도착 순서대로
/// 옵니다. 검색 결과가 없을 때도 빈 소스 이벤트 → 고정 답변 한 조각의
/// 순서를 지킵니다.
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    /// 전체 소스 목록 (스트림당 한 번, 항상 첫 이벤트)
    Sources(Vec<Source>),
    /// 생성된 텍스트 조각
    Delta(String),
}

/// 스트리밍 답변 수신기
///
/// 수신자를 드롭하면 생성 태스크와 기저 LLM 스트림이 함께 정리됩니다.
/// 스트림이 끝난 뒤 전체 답변이 필요하면 호출자가 조각을 이어 붙입니다.
pub struct AnswerStream {
    rx: mpsc::Receiver<Result<AnswerEvent, RagError>>,
}

impl AnswerStream {
    /// 다음 이벤트 (스트림 종료 시 None)
    pub async fn next(&mut self) -> Option<Result<AnswerEvent, RagError>> {
        self.rx.recv().await
    }
}

// ============================================================================
// Errors
// ============================================================================

/// 파이프라인 에러 분류
///
/// 재작성 실패는 여기에 없습니다. 원래 질문으로 폴백하는 성능 저하일
/// 뿐 에러가 아닙니다. 검색 결과 0건도 정상 결과로 처리됩니다.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// 질의 임베딩 실패
    #[error("query embedding failed: {0}")]
    Embedding(anyhow::Error),

    /// 벡터 저장소 질의 실패
    #[error("vector store query failed: {0}")]
    Store(anyhow::Error),

    /// 답변 생성 실패 (타임아웃/전송/API 구분은 내부 에러가 보존)
    #[error(transparent)]
    Generation(#[from] LlmError),
}

// ============================================================================
// RagPipeline
// ============================================================================

/// RAG 파이프라인
///
/// 요청 처리 레이어가 시작 시 한 번 구성해서 모든 요청에 전달합니다.
pub struct RagPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn GenerationProvider>,
    settings: Settings,
}

impl RagPipeline {
    /// 포트들을 주입하여 파이프라인 구성
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn GenerationProvider>,
        settings: Settings,
    ) -> Self {
        Self {
            embedder,
            store,
            llm,
            settings,
        }
    }

    /// 설정 스냅샷 접근
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 내부 벡터 저장소 접근
    pub fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    /// 히스토리 윈도우: 마지막 `2 × max_history_turns`개 메시지
    ///
    /// 재작성과 답변 구성이 같은 윈도우를 공유하도록 한 번만 계산합니다.
    fn history_window<'a>(&self, history: &'a [ChatMessage]) -> &'a [ChatMessage] {
        let max_messages = self.settings.max_history_turns * 2;
        if history.len() > max_messages {
            &history[history.len() - max_messages..]
        } else {
            history
        }
    }

    /// 유사 문서 검색
    ///
    /// 결과 0건은 에러가 아니라 빈 목록입니다.
    ///
    /// # Arguments
    /// * `query` - 검색 질의 (재작성된 질의 또는 원래 질문)
    /// * `top_k` - 결과 수 (None이면 설정값)
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<Vec<Source>, RagError> {
        let top_k = top_k.unwrap_or(self.settings.top_k);

        let embedding = self
            .embedder
            .embed(query, EmbeddingTask::Query)
            .await
            .map_err(RagError::Embedding)?;

        let matches = self
            .store
            .query(&embedding, top_k)
            .await
            .map_err(RagError::Store)?;

        // 인덱스가 준 순서(거리 오름차순)를 그대로 보존
        let sources = matches
            .into_iter()
            .map(|m| Source {
                file_path: non_empty_or_unknown(m.file_path),
                section: non_empty_or_unknown(m.section),
                text: m.text,
                score: 1.0 - m.distance,
            })
            .collect();

        Ok(sources)
    }

    /// 답변 생성 요청 구성 (히스토리 윈도우 + 컨텍스트 + 원래 질문)
    fn answer_request(
        &self,
        question: &str,
        window: &[ChatMessage],
        sources: &[Source],
    ) -> GenerationRequest {
        let context = prompt::build_context(sources);

        let mut messages = window.to_vec();
        messages.push(ChatMessage::user(prompt::build_question_message(
            &context, question,
        )));

        GenerationRequest {
            system: prompt::SYSTEM_PROMPT.to_string(),
            messages,
            max_tokens: self.settings.llm_max_tokens,
            temperature: self.settings.llm_temperature,
        }
    }

    /// 질문에 답변 (동기)
    ///
    /// # Arguments
    /// * `question` - 사용자 질문
    /// * `history` - 이전 대화 (오래된 것부터, 세션 레이어가 소유)
    /// * `top_k` - 검색 결과 수 (None이면 설정값)
    pub async fn ask(
        &self,
        question: &str,
        history: &[ChatMessage],
        top_k: Option<usize>,
    ) -> Result<Answer, RagError> {
        let window = self.history_window(history);

        let search_query =
            rewrite::rewrite_query(self.llm.as_ref(), &self.settings, question, window).await;
        let sources = self.search(&search_query, top_k).await?;

        // 그라운딩 컨텍스트가 없으면 생성 포트를 호출하지 않음
        if sources.is_empty() {
            return Ok(Answer {
                text: prompt::NO_RESULTS_ANSWER.to_string(),
                sources: vec![],
            });
        }

        let request = self.answer_request(question, window, &sources);
        let response = self.llm.generate(request).await?;

        let text = if response.segments.is_empty() {
            prompt::NO_RESPONSE_SENTINEL.to_string()
        } else {
            response.segments.join("\n")
        };

        Ok(Answer { text, sources })
    }

    /// 질문에 답변 (스트리밍)
    ///
    /// 소스 이벤트가 생성 시작 전에 먼저 전달되므로 스트리밍 UI가
    /// 출처를 즉시 표시할 수 있습니다. 반환된 스트림을 드롭하면 진행
    /// 중인 생성 호출이 중단됩니다.
    pub async fn ask_stream(
        &self,
        question: &str,
        history: &[ChatMessage],
        top_k: Option<usize>,
    ) -> Result<AnswerStream, RagError> {
        let window = self.history_window(history);

        let search_query =
            rewrite::rewrite_query(self.llm.as_ref(), &self.settings, question, window).await;
        let sources = self.search(&search_query, top_k).await?;

        let request = if sources.is_empty() {
            None
        } else {
            Some(self.answer_request(question, window, &sources))
        };

        let llm = Arc::clone(&self.llm);
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // 소스 이벤트는 어떤 텍스트보다 먼저
            if tx.send(Ok(AnswerEvent::Sources(sources))).await.is_err() {
                return;
            }

            let Some(request) = request else {
                let _ = tx
                    .send(Ok(AnswerEvent::Delta(prompt::NO_RESULTS_ANSWER.to_string())))
                    .await;
                return;
            };

            let mut tokens = match llm.generate_stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(RagError::Generation(e))).await;
                    return;
                }
            };

            while let Some(item) = tokens.next().await {
                match item {
                    Ok(fragment) => {
                        // 소비자가 떠났으면 스트림을 버려 생성 호출을 중단
                        if tx.send(Ok(AnswerEvent::Delta(fragment))).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(RagError::Generation(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(AnswerStream { rx })
    }
}

/// 메타데이터 결측 시 "unknown" 대체
fn non_empty_or_unknown(value: String) -> String {
    if value.is_empty() {
        "unknown".to_string()
    } else {
        value
    }
}

// ============================================================================
// Tests
// ============================================================================
