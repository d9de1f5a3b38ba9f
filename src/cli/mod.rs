//! CLI 모듈
//!
//! docs-rag CLI 명령어 정의 및 구현. 파이프라인은 명령 실행 시점에
//! 한 번 구성되어 명시적으로 전달됩니다 (전역 싱글톤 없음).

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use crate::chunker::MarkdownChunker;
use crate::config::{has_api_key, Settings};
use crate::embedding::GeminiEmbedding;
use crate::eval::{load_cases, EvalScore, Evaluator};
use crate::indexer;
use crate::llm::{ChatRole, GeminiGeneration};
use crate::mermaid;
use crate::rag::{AnswerEvent, AnswerStream, RagPipeline, Source};
use crate::session::SessionManager;
use crate::store::{LanceVectorStore, VectorStore};

/// 벡터 저장소 디렉토리 이름 (data_dir 기준)
const STORE_DIR_NAME: &str = "chunks.lance";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "docs-rag")]
#[command(version, about = "마크다운 문서 Q&A RAG 시스템", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 문서 디렉토리를 벡터 저장소에 인덱싱
    Index {
        /// 문서 루트 경로 (설정 오버라이드)
        #[arg(short, long)]
        docs_path: Option<PathBuf>,

        /// 인덱싱 전 저장소 초기화
        #[arg(long)]
        reset: bool,
    },

    /// 문서 검색 (답변 생성 없이 검색 결과만)
    Search {
        /// 검색 질의
        query: String,

        /// 결과 개수 (기본: 설정값)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// 단발 질문에 답변
    Ask {
        /// 질문
        question: String,

        /// 검색 결과 개수 (기본: 설정값)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 스트리밍 없이 완성된 답변만 출력
        #[arg(long)]
        no_stream: bool,

        /// 답변의 mermaid 다이어그램 문법 검사
        #[arg(long)]
        check_diagrams: bool,
    },

    /// 대화형 채팅 (세션 히스토리 유지)
    Chat,

    /// 상태 확인
    Status,

    /// 배치 평가 실행
    Eval {
        /// 평가 케이스 JSON 파일
        cases: PathBuf,

        /// 리포트 JSON 저장 경로
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Index { docs_path, reset } => cmd_index(docs_path, reset).await,
        Commands::Search { query, top_k } => cmd_search(&query, top_k).await,
        Commands::Ask {
            question,
            top_k,
            no_stream,
            check_diagrams,
        } => cmd_ask(&question, top_k, no_stream, check_diagrams).await,
        Commands::Chat => cmd_chat().await,
        Commands::Status => cmd_status().await,
        Commands::Eval { cases, output } => cmd_eval(&cases, output).await,
    }
}

// ============================================================================
// Pipeline Construction
// ============================================================================

/// API 키 확인 (없으면 안내와 함께 실패)
fn require_api_key() -> Result<()> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }
    Ok(())
}

/// 벡터 저장소 열기
async fn open_store(settings: &Settings) -> Result<LanceVectorStore> {
    let store_path = settings.data_dir.join(STORE_DIR_NAME);
    LanceVectorStore::open(&store_path, settings.embedding_dimension)
        .await
        .context("벡터 저장소 열기 실패")
}

/// 파이프라인 구성 (포트 주입)
async fn build_pipeline() -> Result<RagPipeline> {
    require_api_key()?;

    let settings = Settings::from_env().context("설정 로드 실패")?;

    let store = open_store(&settings).await?;
    let embedder = GeminiEmbedding::from_settings(&settings).context("임베딩 프로바이더 생성 실패")?;
    let llm = GeminiGeneration::from_settings(&settings).context("생성 프로바이더 생성 실패")?;

    Ok(RagPipeline::new(
        Arc::new(embedder),
        Arc::new(store),
        Arc::new(llm),
        settings,
    ))
}

/// 인덱스 존재 확인
///
/// 저장소가 한 번도 채워지지 않았으면 질의를 받지 않고 즉시
/// 실패합니다. 검색 결과 0건(정상)과는 다른 상태입니다.
async fn ensure_indexed(pipeline: &RagPipeline) -> Result<()> {
    let count = pipeline.store().count().await?;
    if count == 0 {
        bail!(
            "인덱스가 비어 있습니다. 먼저 인덱싱을 실행하세요:\n  \
             docs-rag index --docs-path <문서 경로>"
        );
    }
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 인덱싱 명령어 (index)
async fn cmd_index(docs_path: Option<PathBuf>, reset: bool) -> Result<()> {
    require_api_key()?;

    let settings = Settings::from_env().context("설정 로드 실패")?;
    let docs_path = docs_path.unwrap_or_else(|| settings.docs_path.clone());

    println!("[*] 문서 경로: {}", docs_path.display());
    println!("[*] 저장소 경로: {}", settings.data_dir.join(STORE_DIR_NAME).display());
    println!("[*] 임베딩 모델: {} ({}차원)", settings.embedding_model, settings.embedding_dimension);
    println!();

    let store = open_store(&settings).await?;
    let embedder = GeminiEmbedding::from_settings(&settings)?;
    let chunker = MarkdownChunker::from_settings(&settings);

    if reset {
        println!("[*] 저장소 초기화 중...");
        store.reset().await?;
    }

    println!("[*] 인덱싱 중...");
    let stats = indexer::index_directory(&docs_path, &chunker, &embedder, &store)
        .await
        .context("인덱싱 실패")?;

    println!();
    println!("[OK] 인덱싱 완료");
    println!("     파일: {} 발견, {} 인덱싱, {} 건너뜀", stats.files_found, stats.files_indexed, stats.files_skipped);
    println!("     청크: {} 인덱싱", stats.chunks_indexed);
    println!("     저장소 총 청크: {}", store.count().await?);

    Ok(())
}

/// 검색 명령어 (search)
async fn cmd_search(query: &str, top_k: Option<usize>) -> Result<()> {
    let pipeline = build_pipeline().await?;
    ensure_indexed(&pipeline).await?;

    println!("[*] 검색 중: \"{}\"", query);

    let sources = pipeline.search(query, top_k).await.context("검색 실패")?;

    if sources.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", sources.len());
    for (i, source) in sources.iter().enumerate() {
        println!(
            "{}. [점수: {:.4}] {} - {}",
            i + 1,
            source.score,
            source.file_path,
            source.section
        );
        println!("   내용: {}", truncate_text(&source.text, 200));
        println!();
    }

    Ok(())
}

/// 질문 명령어 (ask)
async fn cmd_ask(
    question: &str,
    top_k: Option<usize>,
    no_stream: bool,
    check_diagrams: bool,
) -> Result<()> {
    let pipeline = build_pipeline().await?;
    ensure_indexed(&pipeline).await?;

    let answer_text = if no_stream {
        let answer = pipeline
            .ask(question, &[], top_k)
            .await
            .context("답변 생성 실패")?;

        print_sources(&answer.sources);
        println!("{}", answer.text);
        answer.text
    } else {
        let stream = pipeline
            .ask_stream(question, &[], top_k)
            .await
            .context("답변 생성 실패")?;
        let text = consume_stream(stream).await?;
        println!();
        text
    };

    if check_diagrams {
        report_diagram_errors(&answer_text).await;
    }

    Ok(())
}

/// 대화형 채팅 명령어 (chat)
async fn cmd_chat() -> Result<()> {
    let pipeline = build_pipeline().await?;
    ensure_indexed(&pipeline).await?;

    let sessions = SessionManager::new(Duration::from_secs(
        pipeline.settings().session_ttl_secs,
    ));
    let session_id = sessions.get_or_create(None);
    let max_turns = pipeline.settings().max_history_turns;

    println!("[*] 대화형 모드입니다. 종료하려면 'exit'를 입력하세요.");
    println!();

    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();

        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        let history = sessions.history(&session_id, max_turns);

        let stream = match pipeline.ask_stream(question, &history, None).await {
            Ok(stream) => stream,
            Err(e) => {
                println!("[!] 오류: {}", e);
                continue;
            }
        };

        let answer_text = match consume_stream(stream).await {
            Ok(text) => text,
            Err(e) => {
                println!("\n[!] 오류: {}", e);
                continue;
            }
        };
        println!();
        println!();

        // 재구성한 답변을 세션에 보존 (다음 턴의 히스토리)
        sessions.add_message(&session_id, ChatRole::User, question);
        sessions.add_message(&session_id, ChatRole::Assistant, answer_text);
    }

    println!("[*] 대화를 종료합니다.");
    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status() -> Result<()> {
    println!("docs-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let settings = Settings::from_env().context("설정 로드 실패")?;

    println!("[*] 문서 경로: {}", settings.docs_path.display());
    println!("[*] 데이터 디렉토리: {}", settings.data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match open_store(&settings).await {
        Ok(store) => match store.count().await {
            Ok(0) => println!("[!] 벡터 인덱스: 비어 있음 (docs-rag index 실행 필요)"),
            Ok(count) => println!("[OK] 벡터 인덱스: {} 청크", count),
            Err(e) => println!("[!] 인덱스 조회 실패: {}", e),
        },
        Err(e) => {
            println!("[!] 벡터 저장소 열기 실패: {}", e);
        }
    }

    Ok(())
}

/// 평가 명령어 (eval)
async fn cmd_eval(cases_path: &std::path::Path, output: Option<PathBuf>) -> Result<()> {
    let pipeline = build_pipeline().await?;
    ensure_indexed(&pipeline).await?;

    let cases = load_cases(cases_path)?;
    println!("[*] 평가 케이스: {} 건", cases.len());
    println!();

    let evaluator = Evaluator::new(&pipeline);
    let report = evaluator
        .evaluate_all(&cases)
        .await
        .context("평가 실행 실패")?;

    for result in &report.results {
        println!(
            "  [{}] {} (점수: {:.2})",
            result.evaluation.as_str(),
            result.case_id,
            result.overall_score
        );
        if !result.keywords_missing.is_empty() {
            println!("       누락 키워드: {}", result.keywords_missing.join(", "));
        }
        if !result.sources_missing.is_empty() {
            println!("       누락 소스: {}", result.sources_missing.join(", "));
        }
    }

    println!();
    println!("[OK] 평균 점수: {:.2}", report.average_score);
    println!(
        "     excellent {} / good {} / partial {} / poor {} / fail {}",
        report.level_count(EvalScore::Excellent),
        report.level_count(EvalScore::Good),
        report.level_count(EvalScore::Partial),
        report.level_count(EvalScore::Poor),
        report.level_count(EvalScore::Fail),
    );

    if let Some(output_path) = output {
        let json = serde_json::to_string_pretty(&report).context("리포트 직렬화 실패")?;
        std::fs::write(&output_path, json)
            .with_context(|| format!("리포트 저장 실패: {:?}", output_path))?;
        println!("     리포트 저장: {}", output_path.display());
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 스트림 소비: 소스 목록 출력 후 텍스트 조각을 즉시 출력
///
/// # Returns
/// 조각을 이어 붙인 전체 답변 텍스트
async fn consume_stream(mut stream: AnswerStream) -> Result<String> {
    let mut full_text = String::new();

    while let Some(event) = stream.next().await {
        match event? {
            AnswerEvent::Sources(sources) => print_sources(&sources),
            AnswerEvent::Delta(fragment) => {
                print!("{}", fragment);
                std::io::stdout().flush()?;
                full_text.push_str(&fragment);
            }
        }
    }

    Ok(full_text)
}

/// 소스 목록 출력
fn print_sources(sources: &[Source]) {
    if sources.is_empty() {
        return;
    }

    println!("[참고 문서]");
    for (i, source) in sources.iter().enumerate() {
        println!(
            "  {}. [{:.4}] {} - {}",
            i + 1,
            source.score,
            source.file_path,
            source.section
        );
    }
    println!();
}

/// 답변의 mermaid 다이어그램 검사 결과 출력
async fn report_diagram_errors(answer_text: &str) {
    let errors = mermaid::validate_all_mermaid(answer_text).await;

    if errors.is_empty() {
        return;
    }

    println!();
    println!("[!] mermaid 다이어그램 오류 {} 건:", errors.len());
    for error in &errors {
        println!("    다이어그램 {}: {}", error.diagram_index, error.error_message);
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        assert_eq!(truncate_text(korean, 5), "안녕하세요...");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["docs-rag", "search", "how does chunking work"]).unwrap();
        assert!(matches!(cli.command, Commands::Search { .. }));

        let cli = Cli::try_parse_from(["docs-rag", "ask", "question", "--no-stream"]).unwrap();
        match cli.command {
            Commands::Ask {
                no_stream, top_k, ..
            } => {
                assert!(no_stream);
                assert!(top_k.is_none());
            }
            _ => panic!("expected ask command"),
        }

        let cli = Cli::try_parse_from(["docs-rag", "index", "--reset"]).unwrap();
        assert!(matches!(cli.command, Commands::Index { reset: true, .. }));
    }
}
