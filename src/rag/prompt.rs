//! 프롬프트 구성 - 시스템 지시문과 그라운딩 컨텍스트 포맷
//!
//! 컨텍스트 블록의 번호와 포맷은 모델에 전달되는 그라운딩 지시문이
//! 의존하는 계약입니다. "Source i"는 항상 `sources[i-1]`로 역추적
//! 가능해야 합니다.

use super::Source;

/// 답변 생성 시스템 지시문
pub const SYSTEM_PROMPT: &str = "\
You are a documentation assistant for a software project.

Your role is to answer questions about the project's architecture, features, and usage based on
the provided documentation context.

Guidelines:
- Answer based ONLY on the provided context
- If the context doesn't contain enough information, say so clearly
- Reference specific sources when relevant (e.g. \"Source 1\")
- Be concise but thorough
- Use code examples from the docs when helpful

If you cannot answer the question from the provided context, respond with:
\"I couldn't find information about that in the documentation. You might want to check the
docs index or rephrase your question.\"
";

/// 질의 재작성 시스템 지시문
pub const REWRITE_SYSTEM_PROMPT: &str = "\
You rewrite follow-up questions into self-contained documentation search queries.

Guidelines:
- Resolve pronouns and references using the conversation history
- Keep the query concise and focused on the information need
- Do not answer the question
- Return only the rewritten query, nothing else
";

/// 검색 결과가 없을 때의 고정 답변
pub const NO_RESULTS_ANSWER: &str =
    "I couldn't find any relevant documentation to answer your question.";

/// 응답에서 텍스트를 전혀 추출하지 못했을 때의 답변
///
/// 호출자는 항상 문자열을 받아야 하므로 빈 값 대신 이 문장을 반환합니다.
pub const NO_RESPONSE_SENTINEL: &str = "No response generated.";

/// 컨텍스트 블록 구분자
const SOURCE_SEPARATOR: &str = "\n\n---\n\n";

/// 검색 결과를 그라운딩 컨텍스트 블록으로 렌더링
///
/// 각 소스는 1부터 번호가 붙은 `[Source i: 파일 - 섹션]` 블록이 됩니다.
pub fn build_context(sources: &[Source]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            format!(
                "[Source {}: {} - {}]\n{}",
                i + 1,
                source.file_path,
                source.section,
                source.text
            )
        })
        .collect::<Vec<_>>()
        .join(SOURCE_SEPARATOR)
}

/// 컨텍스트와 질문을 합친 최종 사용자 메시지
///
/// 검색에는 재작성된 질의를 쓰더라도 생성 모델에는 원래 질문을
/// 그대로 보여줍니다.
pub fn build_question_message(context: &str, question: &str) -> String {
    format!("Context:\n{}\n\n---\n\nQuestion: {}", context, question)
}

/// 질의 재작성을 위한 지시 메시지 (현재 질문 원문 포함)
pub fn build_rewrite_instruction(question: &str) -> String {
    format!(
        "Rewrite the following question as a self-contained search query, using the \
         conversation above to resolve any references.\n\nQuestion: {}",
        question
    )
}

// ============================================================================
// Tests
// ============================================================================
