//! LLM 생성 모듈 - Gemini chat completion 포트
//!
//! 답변 생성을 담당하는 생성 포트입니다. 동기 호출(`generate`)과
//! 토큰 단위 스트리밍(`generate_stream`)을 제공합니다.
//!
//! 타임아웃은 연결/전체가 분리되어 클라이언트 경계에서 강제되며,
//! 재시도는 하지 않습니다. 재시도 정책은 호출자 레이어의 몫입니다.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::config::{get_api_key, Settings};

/// 스트리밍 채널 용량
///
/// 1로 고정하여 생산자가 소비자보다 한 조각 이상 앞서가지 않습니다
/// (배압 지점).
const STREAM_CHANNEL_CAPACITY: usize = 1;

// ============================================================================
// Chat Types
// ============================================================================

/// 대화 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Gemini API 와이어 역할 문자열 ("assistant"는 "model"로 전송)
    fn as_gemini_role(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "model",
        }
    }
}

/// 대화 메시지 (세션 히스토리의 단위)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 생성 요청
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// 시스템 지시문
    pub system: String,
    /// 대화 메시지 (시간순)
    pub messages: Vec<ChatMessage>,
    /// 최대 출력 토큰 수
    pub max_tokens: u32,
    /// 생성 온도
    pub temperature: f32,
}

/// 생성 응답
///
/// 텍스트 세그먼트만 담습니다. 추론(thinking) 파트 등 텍스트가 아닌
/// 세그먼트는 파싱 단계에서 걸러집니다.
#[derive(Debug, Clone, Default)]
pub struct GenerationResponse {
    pub segments: Vec<String>,
}

impl GenerationResponse {
    /// 첫 번째 비어 있지 않은 텍스트 세그먼트
    pub fn first_text(&self) -> Option<&str> {
        self.segments
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// 생성 포트 에러 분류
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// 타임아웃 (연결 또는 전체 호출)
    #[error("LLM request timed out after {0} seconds")]
    Timeout(u64),

    /// 전송 계층 실패
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// API가 에러 상태를 반환
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// 응답 본문을 해석할 수 없음
    #[error("Malformed LLM response: {0}")]
    Malformed(String),
}

/// reqwest 에러를 분류된 에러로 변환
fn map_transport_error(err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout_secs)
    } else {
        LlmError::Transport(err.to_string())
    }
}

// ============================================================================
// Token Stream
// ============================================================================

/// 토큰 단위 스트림
///
/// 수신자를 드롭하면 생산 태스크의 send가 실패하여 기저 HTTP 스트림이
/// 즉시 해제됩니다. 소비 중단이 곧 취소입니다.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String, LlmError>>,
}

impl TokenStream {
    /// 다음 텍스트 조각 (스트림 종료 시 None)
    pub async fn next(&mut self) -> Option<Result<String, LlmError>> {
        self.rx.recv().await
    }

    /// 테스트/어댑터용: 채널 수신자로 직접 구성
    pub(crate) fn from_receiver(rx: mpsc::Receiver<Result<String, LlmError>>) -> Self {
        Self { rx }
    }
}

// ============================================================================
// GenerationProvider Trait
// ============================================================================

/// 생성 프로바이더 트레이트
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 동기 생성 (전체 응답 대기)
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;

    /// 스트리밍 생성 (토큰 단위 조각)
    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream, LlmError>;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Gemini Generation
// ============================================================================

/// Google Gemini 생성 구현체
///
/// `:generateContent` (동기) 및 `:streamGenerateContent?alt=sse`
/// (스트리밍)를 사용합니다.
/// ref: https://ai.google.dev/gemini-api/docs/text-generation
#[derive(Debug)]
pub struct GeminiGeneration {
    api_key: String,
    client: reqwest::Client,
    base_url: Url,
    model: String,
    timeout_secs: u64,
}

impl GeminiGeneration {
    /// 설정에서 생성 (API 키는 환경변수에서)
    pub fn from_settings(settings: &Settings) -> Result<Self, LlmError> {
        let api_key = get_api_key().map_err(|e| LlmError::Transport(e.to_string()))?;
        Self::with_api_key(api_key, settings)
    }

    /// API 키를 지정하여 생성
    pub fn with_api_key(api_key: String, settings: &Settings) -> Result<Self, LlmError> {
        // 연결 타임아웃과 전체 타임아웃을 분리하여 적용
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.llm_connect_timeout_secs))
            .timeout(Duration::from_secs(settings.llm_timeout_secs))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(Self {
            api_key,
            client,
            base_url: settings.api_base_url.clone(),
            model: settings.llm_model.clone(),
            timeout_secs: settings.llm_timeout_secs,
        })
    }

    /// 엔드포인트 URL 구성
    fn endpoint(&self, method: &str) -> Result<Url, LlmError> {
        self.base_url
            .join(&format!("v1beta/models/{}:{}", self.model, method))
            .map_err(|e| LlmError::Transport(format!("invalid endpoint URL: {}", e)))
    }

    /// 요청 본문 구성
    fn build_body(&self, request: &GenerationRequest) -> GenerateBody {
        let contents = request
            .messages
            .iter()
            .map(|m| WireContent {
                role: Some(m.role.as_gemini_role().to_string()),
                parts: vec![WirePart {
                    text: Some(m.content.clone()),
                    thought: None,
                }],
            })
            .collect();

        GenerateBody {
            system_instruction: WireContent {
                role: None,
                parts: vec![WirePart {
                    text: Some(request.system.clone()),
                    thought: None,
                }],
            },
            contents,
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }

    /// 응답 상태 검사 (성공이 아니면 Api 에러로 변환)
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        Err(LlmError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl GenerationProvider for GeminiGeneration {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = self.build_body(&request);

        let response = self
            .client
            .post(self.endpoint("generateContent")?)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let response = Self::check_status(response).await?;

        let text = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Malformed(e.to_string()))?;

        Ok(GenerationResponse {
            segments: response_segments(&parsed),
        })
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream, LlmError> {
        let body = self.build_body(&request);

        let response = self
            .client
            .post(self.endpoint("streamGenerateContent")?)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let timeout_secs = self.timeout_secs;

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(map_transport_error(e, timeout_secs))).await;
                        return;
                    }
                };

                buffer.extend_from_slice(&bytes);

                // SSE는 라인 단위 프로토콜 - 완성된 라인만 처리
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);

                    let Some(data) = parse_sse_data(line.trim_end()) else {
                        continue;
                    };
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }

                    match serde_json::from_str::<GenerateResponse>(data) {
                        Ok(event) => {
                            for segment in response_segments(&event) {
                                // 수신자가 드롭되면 스트림을 버리고 종료 (취소 전파)
                                if tx.send(Ok(segment)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(LlmError::Malformed(e.to_string()))).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(TokenStream::from_receiver(rx))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// SSE / Response Parsing
// ============================================================================

/// SSE 라인에서 data 페이로드 추출
fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// 응답에서 텍스트 세그먼트 추출
///
/// 첫 번째 후보의 파트 중 추론(thought) 파트와 빈 텍스트를 제외합니다.
fn response_segments(response: &GenerateResponse) -> Vec<String> {
    let Some(candidate) = response.candidates.first() else {
        return vec![];
    };
    let Some(content) = &candidate.content else {
        return vec![];
    };

    content
        .parts
        .iter()
        .filter(|part| !part.thought.unwrap_or(false))
        .filter_map(|part| part.text.clone())
        .filter(|text| !text.is_empty())
        .collect()
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateBody {
    #[serde(rename = "systemInstruction")]
    system_instruction: WireContent,
    contents: Vec<WireContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// Tests
// ============================================================================
