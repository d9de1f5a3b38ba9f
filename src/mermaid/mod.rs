//! Mermaid 다이어그램 검증 (best-effort)
//!
//! 답변에 포함된 mermaid 코드 블록을 공식 mmdc CLI로 검증합니다.
//! mmdc가 설치되어 있지 않으면 경고만 남기고 건너뜁니다. 검증은
//! 부가 기능이며 파이프라인을 실패시키지 않습니다.

use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

/// mmdc 실행 타임아웃
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Types
// ============================================================================

/// Mermaid 검증 에러
#[derive(Debug, Clone)]
pub struct MermaidError {
    /// 다이어그램 순번 (1부터)
    pub diagram_index: usize,
    /// 다이어그램 코드
    pub diagram_code: String,
    /// 에러 메시지
    pub error_message: String,
}

// ============================================================================
// Extraction
// ============================================================================

/// 마크다운 텍스트에서 mermaid 코드 블록 추출
pub fn extract_mermaid_blocks(text: &str) -> Vec<String> {
    let pattern = Regex::new(r"(?s)```mermaid\n(.*?)```").expect("valid mermaid regex");

    pattern
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

// ============================================================================
// Validation
// ============================================================================

/// mermaid 다이어그램 검증 (mmdc CLI 사용)
///
/// # Returns
/// 유효하면 None, 문제가 있으면 에러 메시지. mmdc가 없거나 실행에
/// 실패한 경우에도 None (검증 생략).
pub async fn validate_mermaid(code: &str) -> Option<String> {
    let out_path = std::env::temp_dir().join(format!("mermaid-{}.svg", Uuid::new_v4()));

    let spawned = Command::new("mmdc")
        .arg("-i")
        .arg("-")
        .arg("-o")
        .arg(&out_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("mmdc CLI not found - skipping mermaid validation");
            return None;
        }
        Err(e) => {
            tracing::error!("Failed to spawn mmdc: {}", e);
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if stdin.write_all(code.as_bytes()).await.is_err() {
            tracing::error!("Failed to write diagram to mmdc stdin");
            return None;
        }
    }

    let result = tokio::time::timeout(VALIDATION_TIMEOUT, child.wait_with_output()).await;
    let _ = tokio::fs::remove_file(&out_path).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::error!("mmdc execution failed: {}", e);
            return None;
        }
        Err(_) => return Some("Validation timed out".to_string()),
    };

    if output.status.success() {
        return None;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let raw = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };

    Some(extract_error_message(&raw))
}

/// 전체 텍스트의 모든 mermaid 블록 검증
pub async fn validate_all_mermaid(text: &str) -> Vec<MermaidError> {
    let blocks = extract_mermaid_blocks(text);
    let mut errors = Vec::new();

    for (i, block) in blocks.iter().enumerate() {
        if let Some(message) = validate_mermaid(block).await {
            errors.push(MermaidError {
                diagram_index: i + 1,
                diagram_code: block.clone(),
                error_message: message,
            });
        }
    }

    errors
}

/// mmdc 출력에서 의미 있는 파싱 에러만 추출
fn extract_error_message(raw: &str) -> String {
    if !raw.contains("Error:") {
        return raw.trim().to_string();
    }

    let mut lines = Vec::new();
    let mut capturing = false;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Error:") {
            capturing = true;
        }
        if capturing {
            // 스택 트레이스부터는 버림
            if trimmed.starts_with("at ") || trimmed.starts_with("Parser") {
                break;
            }
            lines.push(line);
        }
    }

    lines.join("\n").trim().to_string()
}

// ============================================================================
// LLM Feedback
// ============================================================================

/// 에러 목록을 LLM 수정 요청 프롬프트로 포맷
pub fn format_errors_for_llm(errors: &[MermaidError]) -> String {
    let mut parts = vec!["The following mermaid diagrams have syntax errors:\n".to_string()];

    for error in errors {
        parts.push(format!("Diagram {}:", error.diagram_index));
        parts.push(format!("```mermaid\n{}```", error.diagram_code));
        parts.push(format!("Error: {}\n", error.error_message));
    }

    parts.push(
        "Please fix the syntax errors in these diagrams and provide the corrected \
         version of your complete response."
            .to_string(),
    );

    parts.join("\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_no_blocks() {
        assert!(extract_mermaid_blocks("plain text without diagrams").is_empty());
    }

    #[test]
    fn test_extract_single_block() {
        let text = "Before\n\n```mermaid\ngraph TD;\n  A-->B;\n```\n\nAfter";
        let blocks = extract_mermaid_blocks(text);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], "graph TD;\n  A-->B;\n");
    }

    #[test]
    fn test_extract_multiple_blocks() {
        let text = "```mermaid\ngraph A\n```\ntext\n```mermaid\ngraph B\n```";
        let blocks = extract_mermaid_blocks(text);

        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("graph A"));
        assert!(blocks[1].contains("graph B"));
    }

    #[test]
    fn test_non_mermaid_fences_ignored() {
        let text = "```rust\nfn main() {}\n```";
        assert!(extract_mermaid_blocks(text).is_empty());
    }

    #[test]
    fn test_extract_error_message_trims_stack_trace() {
        let raw = "\
some preamble
Error: Parse error on line 2
Expecting 'SEMI', got 'NODE_STRING'
    at Parser.parseError (/usr/lib/node_modules/mermaid/parser.js:10)
    at more frames";

        let message = extract_error_message(raw);

        assert!(message.starts_with("Error: Parse error on line 2"));
        assert!(message.contains("Expecting 'SEMI'"));
        assert!(!message.contains("parser.js"));
    }

    #[test]
    fn test_extract_error_message_without_marker() {
        assert_eq!(extract_error_message("  something failed \n"), "something failed");
    }

    #[test]
    fn test_format_errors_for_llm() {
        let errors = vec![MermaidError {
            diagram_index: 1,
            diagram_code: "graph TD;\nA--->B\n".to_string(),
            error_message: "Parse error on line 2".to_string(),
        }];

        let prompt = format_errors_for_llm(&errors);

        assert!(prompt.contains("Diagram 1:"));
        assert!(prompt.contains("```mermaid\ngraph TD;\nA--->B\n```"));
        assert!(prompt.contains("Error: Parse error on line 2"));
        assert!(prompt.contains("Please fix the syntax errors"));
    }
}
