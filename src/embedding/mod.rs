//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 텍스트를 벡터로 변환하는 임베딩 포트입니다. 동일 모델 버전에서
//! 동일 입력은 항상 동일 벡터를 반환합니다 (결정적).
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_settings(&settings)?;
//! let vector = embedder.embed("Hello, world!", EmbeddingTask::Query).await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::config::{get_api_key, Settings};

/// 지원하는 임베딩 차원
const VALID_DIMENSIONS: [usize; 3] = [768, 1536, 3072];

/// 배치 임베딩 요청당 최대 텍스트 수 (API 제한)
const MAX_BATCH_SIZE: usize = 100;

/// Rate Limiter 설정 (무료 티어 기준 60 RPM)
const RATE_LIMIT_RPM: usize = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// 429 에러 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 2000;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 작업 유형
///
/// Gemini는 저장용 문서와 검색 질의를 구분하여 임베딩 품질을 높입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    /// 인덱싱할 문서 본문
    Document,
    /// 검색 질의
    Query,
}

impl EmbeddingTask {
    fn as_api_str(&self) -> &'static str {
        match self {
            EmbeddingTask::Document => "RETRIEVAL_DOCUMENT",
            EmbeddingTask::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String], task: EmbeddingTask) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text, task).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// 슬라이딩 윈도우 방식의 요청 제한기
#[derive(Debug)]
struct RateWindow {
    requests: Vec<Instant>,
    max_requests: usize,
    window: Duration,
}

impl RateWindow {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
        }
    }

    /// 윈도우에 여유가 생길 때까지 대기 후 요청 기록
    async fn acquire(&mut self) {
        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        if self.requests.len() >= self.max_requests {
            if let Some(&oldest) = self.requests.first() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    tracing::debug!("Embedding rate limit reached, waiting {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        self.requests.push(Instant::now());
    }
}

// ============================================================================
// Gemini Embedding
// ============================================================================

/// Google Gemini 임베딩 구현체
///
/// ref: https://ai.google.dev/gemini-api/docs/embeddings
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    base_url: Url,
    model: String,
    dimension: usize,
    limiter: Arc<Mutex<RateWindow>>,
}

impl GeminiEmbedding {
    /// 설정에서 생성 (API 키는 환경변수에서)
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = get_api_key()?;
        Self::with_api_key(api_key, settings)
    }

    /// API 키를 지정하여 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `settings` - 모델/차원/베이스 URL 설정
    pub fn with_api_key(api_key: String, settings: &Settings) -> Result<Self> {
        if !VALID_DIMENSIONS.contains(&settings.embedding_dimension) {
            anyhow::bail!(
                "Invalid embedding dimension: {}. Must be one of {:?}",
                settings.embedding_dimension,
                VALID_DIMENSIONS
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            base_url: settings.api_base_url.clone(),
            model: settings.embedding_model.clone(),
            dimension: settings.embedding_dimension,
            limiter: Arc::new(Mutex::new(RateWindow::new(RATE_LIMIT_RPM, RATE_LIMIT_WINDOW))),
        })
    }

    /// 단일 임베딩 엔드포인트 URL
    fn embed_url(&self) -> Result<Url> {
        self.base_url
            .join(&format!("v1beta/models/{}:embedContent", self.model))
            .context("Failed to build embedContent URL")
    }

    /// 배치 임베딩 엔드포인트 URL
    fn batch_url(&self) -> Result<Url> {
        self.base_url
            .join(&format!("v1beta/models/{}:batchEmbedContents", self.model))
            .context("Failed to build batchEmbedContents URL")
    }

    /// 요청 본문 구성
    fn build_request(&self, text: &str, task: EmbeddingTask) -> EmbedRequest {
        EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type: task.as_api_str().to_string(),
            output_dimensionality: Some(self.dimension),
        }
    }

    /// 요청 전송 + 429 재시도 (지수 백오프)
    async fn post_with_retry<B: Serialize>(&self, url: Url, body: &B) -> Result<String> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            {
                let mut limiter = self.limiter.lock().await;
                limiter.acquire().await;
            }

            // API 키는 URL이 아닌 헤더로 전송
            let response = match self
                .client
                .post(url.clone())
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    if attempt < MAX_RETRIES {
                        let backoff = backoff_delay(attempt);
                        tracing::warn!(
                            "Embedding request failed, retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .context("Failed to read embedding response body")?;

            if status.is_success() {
                return Ok(text);
            }

            if status.as_u16() == 429 {
                last_error = Some(anyhow::anyhow!("Rate limit exceeded (429)"));
                if attempt < MAX_RETRIES {
                    let backoff = backoff_delay(attempt);
                    tracing::warn!(
                        "Rate limit hit (429), backing off {:?} (attempt {}/{})",
                        backoff,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            } else {
                if let Ok(error) = serde_json::from_str::<ApiError>(&text) {
                    anyhow::bail!(
                        "Gemini API error ({}): {}",
                        error.error.status,
                        error.error.message
                    );
                }
                anyhow::bail!("Gemini API error ({}): {}", status, text);
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }
}

/// 재시도 백오프 계산
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>> {
        // 빈 텍스트는 API를 거치지 않고 영벡터 반환
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = self.build_request(text, task);
        let body = self.post_with_retry(self.embed_url()?, &request).await?;

        let parsed: EmbedResponse =
            serde_json::from_str(&body).context("Failed to parse embedding response")?;

        Ok(parsed.embedding.values)
    }

    async fn embed_batch(&self, texts: &[String], task: EmbeddingTask) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        // 빈 텍스트는 영벡터로 채우고 나머지만 API로 전송
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results[i] = Some(vec![0.0; self.dimension]);
            } else {
                pending.push(i);
            }
        }

        for (batch_no, batch) in pending.chunks(MAX_BATCH_SIZE).enumerate() {
            tracing::debug!("Embedding batch {} ({} texts)", batch_no + 1, batch.len());

            let requests: Vec<EmbedRequest> = batch
                .iter()
                .map(|&i| self.build_request(&texts[i], task))
                .collect();

            let body = self
                .post_with_retry(self.batch_url()?, &BatchEmbedRequest { requests })
                .await?;

            let parsed: BatchEmbedResponse =
                serde_json::from_str(&body).context("Failed to parse batch embedding response")?;

            if parsed.embeddings.len() != batch.len() {
                anyhow::bail!(
                    "Batch embedding count mismatch: sent {}, received {}",
                    batch.len(),
                    parsed.embeddings.len()
                );
            }

            for (&i, values) in batch.iter().zip(parsed.embeddings) {
                results[i] = Some(values.values);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("every index filled"))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// 임베딩 요청 본문
/// source: https://ai.google.dev/gemini-api/docs/embeddings
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: String,
    #[serde(rename = "outputDimensionality", skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// API 에러 응답
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

// ============================================================================
// Tests
// ============================================================================
